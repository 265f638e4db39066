//! OAuth 2.0 authorization endpoint

use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::debug;
use url::Url;

use super::error::{ErrorCode, http_error, redirect_auth_error, server_error};
use super::{IdpServer, SUPPORTED_SCOPES, constant_time_eq, form_value, form_values, parse_form};
use crate::grants::{AuthRequest, CODE_TTL, hex_string};

/// GET /authorize
///
/// The URL the end user's browser visits. It must be reached over the
/// tailnet: the peer-identity lookup on the source address is what
/// authenticates the user, so a funneled visitor by definition is not a
/// member of the tailnet they are authenticating for.
pub async fn authorize(State(state): State<Arc<IdpServer>>, request: Request) -> Response {
    let (parts, _) = request.into_parts();

    if super::is_funnel_request(&parts) {
        return http_error(
            StatusCode::UNAUTHORIZED,
            ErrorCode::AccessDenied,
            "not allowed over funnel",
        );
    }

    let query = parse_form(parts.uri.query().unwrap_or("").as_bytes());
    let auth_state = form_value(&query, "state").unwrap_or("");

    let Some(redirect_uri) = form_value(&query, "redirect_uri") else {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            "must specify redirect_uri",
        );
    };
    let Some(client_id) = form_value(&query, "client_id") else {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidClient,
            "must specify client_id",
        );
    };

    let Some(funnel_client) = state.clients.get(client_id) else {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidClient,
            "invalid client ID",
        );
    };
    if !constant_time_eq(client_id, &funnel_client.id) {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidClient,
            "invalid client ID",
        );
    }

    // Exact-match redirect URI comparison; no substring or path rules.
    if !funnel_client
        .redirect_uris
        .iter()
        .any(|u| u.as_str() == redirect_uri)
    {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            "redirect_uri mismatch",
        );
    }

    // Check who is visiting the authorize endpoint.
    let remote_user = match state.who_is(&parts).await {
        Ok(identity) => identity,
        Err(e) => return server_error("failed to authenticate user with WhoIs", &e),
    };

    let mut ar = AuthRequest {
        client_id: client_id.to_string(),
        funnel_rp: Some(funnel_client),
        nonce: form_value(&query, "nonce").unwrap_or("").to_string(),
        redirect_uri: redirect_uri.to_string(),
        resources: form_values(&query, "resource"),
        remote_user,
        valid_till: Some(SystemTime::now() + CODE_TTL),
        ..AuthRequest::default()
    };

    let requested: Vec<String> = form_value(&query, "scope")
        .unwrap_or("")
        .split_whitespace()
        .map(str::to_string)
        .collect();
    match validate_scopes(requested) {
        Ok(scopes) => ar.scopes = scopes,
        Err(reason) => {
            return redirect_auth_error(
                redirect_uri,
                ErrorCode::InvalidScope,
                &format!("invalid scope: {reason}"),
                auth_state,
            );
        }
    }

    // PKCE (RFC 7636): optional, but validated when the client initiates it.
    if let Some(challenge) = form_value(&query, "code_challenge") {
        if !challenge.is_empty() {
            let method = form_value(&query, "code_challenge_method").unwrap_or("plain");
            if method != "plain" && method != "S256" {
                return redirect_auth_error(
                    redirect_uri,
                    ErrorCode::InvalidRequest,
                    "unsupported code_challenge_method",
                    auth_state,
                );
            }
            ar.code_challenge = Some(challenge.to_string());
            ar.code_challenge_method = Some(method.to_string());
        }
    }

    let code = hex_string(32);
    state.grants.put_code(&code, ar);

    let mut location = match Url::parse(redirect_uri) {
        Ok(url) => url,
        Err(e) => return server_error("invalid redirect URI", &e),
    };
    location.set_query(None);
    {
        let mut pairs = location.query_pairs_mut();
        pairs.append_pair("code", &code);
        if !auth_state.is_empty() {
            pairs.append_pair("state", auth_state);
        }
    }

    debug!(url = %location, "authorize redirect");
    (
        StatusCode::FOUND,
        [(axum::http::header::LOCATION, location.to_string())],
    )
        .into_response()
}

/// Validate requested scopes against the supported set. An empty request
/// defaults to `openid`.
fn validate_scopes(requested: Vec<String>) -> Result<Vec<String>, String> {
    if requested.is_empty() {
        return Ok(vec!["openid".to_string()]);
    }
    for scope in &requested {
        if !SUPPORTED_SCOPES.contains(&scope.as_str()) {
            return Err(format!("unsupported scope: {scope:?}"));
        }
    }
    Ok(requested)
}
