//! Dynamic client registration (RFC 7591 subset)
//!
//! Tailnet-only: funneled callers cannot mint credentials, and the caller
//! must hold the same capability that gates the management UI.

use std::sync::Arc;
use std::time::UNIX_EPOCH;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::error::{ErrorCode, http_error, server_error};
use super::ui::admin_gate;
use super::{IdpServer, read_body};
use crate::Error;

/// Registration request body
#[derive(Debug, Deserialize)]
struct RegistrationRequest {
    redirect_uris: Vec<String>,
    #[serde(default)]
    client_name: String,
}

/// POST /register
pub async fn register(State(state): State<Arc<IdpServer>>, request: Request) -> Response {
    let (parts, body) = match read_body(request).await {
        Ok(read) => read,
        Err(e) => return server_error("failed to read request body", &e),
    };

    if let Err(resp) = admin_gate(&state, &parts).await {
        return *resp;
    }

    let registration: RegistrationRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return http_error(
                StatusCode::BAD_REQUEST,
                ErrorCode::InvalidRequest,
                &format!("invalid registration request: {e}"),
            );
        }
    };

    let client = match state
        .clients
        .register(&registration.client_name, registration.redirect_uris)
    {
        Ok(client) => client,
        Err(Error::RedirectUri(reason)) => {
            return http_error(StatusCode::BAD_REQUEST, ErrorCode::InvalidRequest, &reason);
        }
        Err(e) => return server_error("failed to persist client", &e),
    };

    info!(client_id = %client.id, name = %client.name, "Registered new client");

    let issued_at = client
        .created_at
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    (
        StatusCode::CREATED,
        Json(json!({
            "client_id": client.id,
            "client_secret": client.secret,
            "client_id_issued_at": issued_at,
            "client_secret_expires_at": 0,
            "client_name": client.name,
            "redirect_uris": client.redirect_uris,
            "token_endpoint_auth_method": "client_secret_basic",
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
        })),
    )
        .into_response()
}
