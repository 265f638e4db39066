//! UserInfo and token-introspection endpoints

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value, json};

use super::error::{ErrorCode, bearer_error, http_error, server_error};
use super::token::audiences;
use super::{IdpServer, constant_time_eq, form_value, parse_form, read_body};
use crate::claims;

/// GET /userinfo
pub async fn user_info(State(state): State<Arc<IdpServer>>, request: Request) -> Response {
    let (parts, _) = request.into_parts();

    let bearer = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(token) = bearer else {
        return bearer_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            "invalid Authorization header",
        );
    };

    let Some(ar) = state.grants.peek_access(token) else {
        return bearer_error(
            StatusCode::UNAUTHORIZED,
            ErrorCode::InvalidToken,
            "invalid token",
        );
    };
    if ar.is_expired(SystemTime::now()) {
        state.grants.remove_access(token);
        return bearer_error(
            StatusCode::UNAUTHORIZED,
            ErrorCode::InvalidToken,
            "token expired",
        );
    }

    let user = &ar.remote_user;
    if user.tagged {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            "tagged nodes not supported",
        );
    }

    // sub is always present; profile fields only when the overlay knows them.
    let mut info = Map::new();
    info.insert("sub".to_string(), json!(user.user_id));
    if !user.display_name.is_empty() {
        info.insert("name".to_string(), json!(user.display_name));
    }
    if !user.login_name.is_empty() {
        info.insert(
            "email".to_string(),
            json!(state.realish_email(&user.login_name)),
        );
    }
    if !user.profile_pic_url.is_empty() {
        info.insert("picture".to_string(), json!(user.profile_pic_url));
    }
    if let Some((username, _)) = user.login_name.split_once('@') {
        info.insert("username".to_string(), json!(username));
    }

    let rules = match user.cap_rules() {
        Ok(rules) => rules,
        Err(e) => {
            return http_error(
                StatusCode::BAD_REQUEST,
                ErrorCode::InvalidRequest,
                &e.to_string(),
            );
        }
    };

    match claims::with_extra_claims(info, &claims::rules_for_user_info(&rules)) {
        Ok(merged) => Json(Value::Object(merged)).into_response(),
        Err(e) => http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            &e.to_string(),
        ),
    }
}

/// POST /introspect
///
/// RFC 7662 token introspection for registered clients. Anything but a
/// live, well-formed token yields `{"active": false}`.
pub async fn introspect(State(state): State<Arc<IdpServer>>, request: Request) -> Response {
    let (parts, body) = match read_body(request).await {
        Ok(read) => read,
        Err(e) => return server_error("failed to read request body", &e),
    };
    let form = parse_form(&body);

    if !authenticate_client(&state, &parts, &form) {
        return http_error(
            StatusCode::UNAUTHORIZED,
            ErrorCode::InvalidClient,
            "client authentication required",
        );
    }

    let Some(token) = form_value(&form, "token") else {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            "must specify token",
        );
    };

    let Some(ar) = state.grants.lookup_access(token) else {
        return Json(json!({"active": false})).into_response();
    };

    let mut body = Map::new();
    body.insert("active".to_string(), json!(true));
    body.insert("client_id".to_string(), json!(ar.client_id));
    body.insert("scope".to_string(), json!(ar.scopes.join(" ")));
    body.insert("sub".to_string(), json!(ar.remote_user.user_id));
    body.insert("aud".to_string(), audiences(&ar));
    body.insert("jti".to_string(), json!(ar.jti));
    body.insert("token_type".to_string(), json!("Bearer"));
    if let Some(exp) = ar.valid_till {
        let exp = exp.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        body.insert("exp".to_string(), json!(exp));
        // Access tokens are issued with a fixed lifetime.
        body.insert(
            "iat".to_string(),
            json!(exp.saturating_sub(state.config.access_token_ttl.as_secs())),
        );
    }
    if let Some((username, _)) = ar.remote_user.login_name.split_once('@') {
        body.insert("username".to_string(), json!(username));
    }

    Json(Value::Object(body)).into_response()
}

/// Validate introspection client credentials against the registry.
fn authenticate_client(
    state: &IdpServer,
    parts: &axum::http::request::Parts,
    form: &[(String, String)],
) -> bool {
    let Some(creds) = super::token::client_credentials(parts, form) else {
        return false;
    };
    state.clients.get(&creds.id).is_some_and(|client| {
        constant_time_eq(&creds.id, &client.id) && constant_time_eq(&creds.secret, &client.secret)
    })
}
