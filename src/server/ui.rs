//! Client-management UI
//!
//! Tailnet-only pages for listing, creating, and editing funnel clients.
//! Every request passes the admin capability gate; mutating requests also
//! pass CSRF checks based on `Sec-Fetch-Site` and the `Origin` header.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::SystemTime;

use axum::extract::{Path, Request, State};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use tracing::error;
use url::Url;

use super::error::{ErrorCode, http_error, server_error};
use super::{IdpServer, form_value, parse_form, read_body};
use crate::Error;
use crate::grants::hex_string;

static STYLE_CSS: &str = include_str!("ui-style.css");

fn process_start() -> SystemTime {
    static START: OnceLock<SystemTime> = OnceLock::new();
    *START.get_or_init(SystemTime::now)
}

/// Reject funneled callers and callers without the admin capability.
///
/// # Errors
///
/// Returns the error response to send: 401 over funnel, 500 when the peer
/// lookup fails, 403 when the capability is missing.
pub(crate) async fn admin_gate(state: &IdpServer, parts: &Parts) -> Result<(), Box<Response>> {
    if super::is_funnel_request(parts) {
        return Err(Box::new(http_error(
            StatusCode::UNAUTHORIZED,
            ErrorCode::AccessDenied,
            "not available over funnel",
        )));
    }

    if state.config.bypass_admin_cap {
        return Ok(());
    }

    let identity = state
        .who_is(parts)
        .await
        .map_err(|e| Box::new(server_error("failed to authenticate user with WhoIs", &e)))?;
    if !identity.allows_admin_ui() {
        return Err(Box::new(http_error(
            StatusCode::FORBIDDEN,
            ErrorCode::AccessDenied,
            "application capability not granted",
        )));
    }
    Ok(())
}

/// Reject cross-site mutations. `Sec-Fetch-Site: cross-site` fails; a
/// present `Origin` whose scheme+host+port differ from the server URL
/// fails; same-origin, same-site, and absent metadata pass.
fn check_csrf(state: &IdpServer, parts: &Parts) -> Result<(), Box<Response>> {
    let reject = || {
        Box::new(http_error(
            StatusCode::FORBIDDEN,
            ErrorCode::AccessDenied,
            "cross-site request rejected",
        ))
    };

    if let Some(site) = parts
        .headers
        .get("Sec-Fetch-Site")
        .and_then(|v| v.to_str().ok())
    {
        if site == "cross-site" {
            return Err(reject());
        }
    }

    if let Some(origin) = parts.headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        let Ok(origin) = Url::parse(origin) else {
            return Err(reject());
        };
        let Ok(own) = Url::parse(&state.config.server_url) else {
            return Err(reject());
        };
        let same = origin.scheme() == own.scheme()
            && origin.host_str() == own.host_str()
            && origin.port_or_known_default() == own.port_or_known_default();
        if !same {
            return Err(reject());
        }
    }

    Ok(())
}

/// GET /
pub async fn clients_list(State(state): State<Arc<IdpServer>>, request: Request) -> Response {
    let (parts, _) = request.into_parts();
    if let Err(resp) = admin_gate(&state, &parts).await {
        return *resp;
    }

    let mut clients = state.clients.list();
    clients.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

    let mut rows = String::new();
    for client in &clients {
        rows.push_str(&format!(
            "<tr><td><a href=\"/edit/{id}\">{name}</a></td><td><code>{id}</code></td>\
             <td>{uris}</td></tr>\n",
            id = escape(&client.id),
            name = escape(if client.name.is_empty() {
                "(unnamed)"
            } else {
                &client.name
            }),
            uris = escape(&client.redirect_uris.join(" ")),
        ));
    }
    if clients.is_empty() {
        rows.push_str("<tr><td colspan=\"3\">No clients registered.</td></tr>\n");
    }

    page(
        "OIDC Clients",
        &format!(
            "<p><a class=\"button\" href=\"/new\">New client</a></p>\
             <table><tr><th>Name</th><th>Client ID</th><th>Redirect URIs</th></tr>{rows}</table>"
        ),
    )
}

/// Form state shared by the new and edit pages.
#[derive(Default)]
struct ClientForm {
    id: String,
    name: String,
    redirect_uris: Vec<String>,
    secret: String,
    is_edit: bool,
    error: String,
    success: String,
}

/// GET/POST /new
pub async fn new_client(State(state): State<Arc<IdpServer>>, request: Request) -> Response {
    let (parts, body) = match read_body(request).await {
        Ok(read) => read,
        Err(e) => return server_error("failed to read request body", &e),
    };
    if let Err(resp) = admin_gate(&state, &parts).await {
        return *resp;
    }

    if parts.method == Method::GET {
        return render_form(&ClientForm::default());
    }

    if let Err(resp) = check_csrf(&state, &parts) {
        return *resp;
    }

    let form = parse_form(&body);
    let name = form_value(&form, "name").unwrap_or("").trim().to_string();
    let redirect_uris = split_redirect_uris(form_value(&form, "redirect_uris").unwrap_or(""));

    let mut data = ClientForm {
        name: name.clone(),
        redirect_uris: redirect_uris.clone(),
        ..ClientForm::default()
    };

    match state.clients.register(&name, redirect_uris) {
        Ok(client) => {
            data.id = client.id;
            data.secret = client.secret;
            data.success =
                "Client created. Save the client secret - it won't be shown again.".to_string();
            render_form(&data)
        }
        Err(Error::RedirectUri(reason)) => {
            data.error = format!("Invalid redirect URI: {reason}");
            render_form(&data)
        }
        Err(e) => {
            error!(error = %e, "client create: could not write client registry");
            data.error = "Failed to save client".to_string();
            render_form(&data)
        }
    }
}

/// GET/POST /edit/{id}
pub async fn edit_client(
    State(state): State<Arc<IdpServer>>,
    Path(client_id): Path<String>,
    request: Request,
) -> Response {
    let (parts, body) = match read_body(request).await {
        Ok(read) => read,
        Err(e) => return server_error("failed to read request body", &e),
    };
    if let Err(resp) = admin_gate(&state, &parts).await {
        return *resp;
    }

    let Some(client) = state.clients.get(&client_id) else {
        return http_error(StatusCode::NOT_FOUND, ErrorCode::NotFound, "client not found");
    };

    let mut data = ClientForm {
        id: client.id.clone(),
        name: client.name.clone(),
        redirect_uris: client.redirect_uris.clone(),
        is_edit: true,
        ..ClientForm::default()
    };

    if parts.method == Method::GET {
        return render_form(&data);
    }

    if let Err(resp) = check_csrf(&state, &parts) {
        return *resp;
    }

    let form = parse_form(&body);
    match form_value(&form, "action") {
        Some("delete") => match state.clients.remove(&client_id) {
            Ok(_) => (
                StatusCode::SEE_OTHER,
                [(header::LOCATION, "/")],
            )
                .into_response(),
            Err(e) => {
                error!(error = %e, "client delete: could not write client registry");
                data.error = "Failed to delete client. Please try again.".to_string();
                render_form(&data)
            }
        },
        Some("regenerate_secret") => {
            let mut updated = client.clone();
            updated.secret = hex_string(64);
            match state.clients.put(updated.clone()) {
                Ok(()) => {
                    data.secret = updated.secret;
                    data.success =
                        "New client secret generated. Save it - it won't be shown again."
                            .to_string();
                    render_form(&data)
                }
                Err(e) => {
                    error!(error = %e, "client regen secret: could not write client registry");
                    data.error = "Failed to regenerate secret".to_string();
                    render_form(&data)
                }
            }
        }
        _ => {
            let name = form_value(&form, "name").unwrap_or("").trim().to_string();
            let redirect_uris =
                split_redirect_uris(form_value(&form, "redirect_uris").unwrap_or(""));
            data.name = name.clone();
            data.redirect_uris = redirect_uris.clone();

            if redirect_uris.is_empty() {
                data.error = "At least one redirect URI is required".to_string();
                return render_form(&data);
            }
            for uri in &redirect_uris {
                if let Some(reason) = crate::clients::validate_redirect_uri(uri) {
                    data.error = format!("Invalid redirect URI '{uri}': {reason}");
                    return render_form(&data);
                }
            }

            let mut updated = client.clone();
            updated.name = name;
            updated.redirect_uris = redirect_uris;
            match state.clients.put(updated) {
                Ok(()) => {
                    data.success = "Client updated".to_string();
                    render_form(&data)
                }
                Err(e) => {
                    error!(error = %e, "client update: could not write client registry");
                    data.error = "Failed to update client".to_string();
                    render_form(&data)
                }
            }
        }
    }
}

/// GET /style.css
pub async fn style_css(State(state): State<Arc<IdpServer>>, request: Request) -> Response {
    let (parts, _) = request.into_parts();
    if let Err(resp) = admin_gate(&state, &parts).await {
        return *resp;
    }
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/css".to_string()),
            // Stable across the process lifetime; good enough for caching.
            (
                header::LAST_MODIFIED,
                httpdate::fmt_http_date(process_start()),
            ),
        ],
        STYLE_CSS,
    )
        .into_response()
}

/// Split a textarea of redirect URIs on newlines and commas.
fn split_redirect_uris(input: &str) -> Vec<String> {
    input
        .split(['\n', '\r', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn render_form(data: &ClientForm) -> Response {
    let title = if data.is_edit {
        "Edit client"
    } else {
        "New client"
    };
    let action = if data.is_edit {
        format!("/edit/{}", escape(&data.id))
    } else {
        "/new".to_string()
    };

    let mut body = String::new();
    if !data.error.is_empty() {
        body.push_str(&format!(
            "<p class=\"error\">{}</p>",
            escape(&data.error)
        ));
    }
    if !data.success.is_empty() {
        body.push_str(&format!(
            "<p class=\"success\">{}</p>",
            escape(&data.success)
        ));
    }
    if data.is_edit {
        body.push_str(&format!(
            "<p>Client ID: <code>{}</code></p>",
            escape(&data.id)
        ));
    }
    if !data.secret.is_empty() {
        body.push_str(&format!(
            "<p>Client secret: <code>{}</code></p>",
            escape(&data.secret)
        ));
    }

    body.push_str(&format!(
        "<form method=\"post\" action=\"{action}\">\
         <label>Name <input name=\"name\" value=\"{name}\"></label>\
         <label>Redirect URIs (one per line)\
         <textarea name=\"redirect_uris\" rows=\"4\">{uris}</textarea></label>\
         <button type=\"submit\">Save</button></form>",
        name = escape(&data.name),
        uris = escape(&data.redirect_uris.join("\n")),
    ));

    if data.is_edit {
        body.push_str(&format!(
            "<form method=\"post\" action=\"{action}\">\
             <input type=\"hidden\" name=\"action\" value=\"regenerate_secret\">\
             <button type=\"submit\">Regenerate secret</button></form>\
             <form method=\"post\" action=\"{action}\">\
             <input type=\"hidden\" name=\"action\" value=\"delete\">\
             <button type=\"submit\" class=\"danger\">Delete</button></form>"
        ));
    }

    page(title, &body)
}

fn page(title: &str, body: &str) -> Response {
    Html(format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
         <title>{title} - tsidp</title>\
         <link rel=\"stylesheet\" href=\"/style.css\"></head>\
         <body><header><h1><a href=\"/\">tsidp</a></h1></header>\
         <main><h2>{title}</h2>{body}</main></body></html>",
        title = escape(title),
    ))
    .into_response()
}

/// Minimal HTML escaping for text and attribute values.
fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_covers_html_metacharacters() {
        assert_eq!(
            escape("<a href=\"x\">&'</a>"),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;&lt;/a&gt;"
        );
        assert_eq!(escape("plain"), "plain");
    }

    #[test]
    fn split_redirect_uris_handles_newlines_and_commas() {
        let uris = split_redirect_uris("https://a/cb\nhttps://b/cb, https://c/cb\r\n\n");
        assert_eq!(uris, vec!["https://a/cb", "https://b/cb", "https://c/cb"]);
        assert!(split_redirect_uris("  \n ").is_empty());
    }
}
