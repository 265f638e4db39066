//! OAuth/OIDC error responses
//!
//! Three delivery channels: JSON bodies for errors caught before the
//! redirect URI is validated, query-parameter redirects afterwards (RFC 6749
//! §4.1.2.1), and `WWW-Authenticate` headers for bearer-token errors
//! (RFC 6750 §3.1).

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, info};
use url::Url;

/// Error codes surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed parameters
    InvalidRequest,
    /// Unknown or misauthenticated client
    InvalidClient,
    /// Bad/expired code, bad PKCE verifier, redirect mismatch
    InvalidGrant,
    /// Unknown scope
    InvalidScope,
    /// Bad/expired bearer token
    InvalidToken,
    /// Grant type not enabled or unknown
    UnsupportedGrantType,
    /// Funnel where tailnet required, or capability missing
    AccessDenied,
    /// Internal failure
    ServerError,
    /// Unknown UI resource
    NotFound,
}

impl ErrorCode {
    /// Wire name of the error code
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::InvalidScope => "invalid_scope",
            Self::InvalidToken => "invalid_token",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::AccessDenied => "access_denied",
            Self::ServerError => "server_error",
            Self::NotFound => "not_found",
        }
    }
}

/// Write an error as a JSON body response.
pub fn http_error(status: StatusCode, code: ErrorCode, description: &str) -> Response {
    (
        status,
        Json(json!({
            "error": code.as_str(),
            "error_description": description,
        })),
    )
        .into_response()
}

/// Write a `server_error` body, logging the underlying cause. The
/// client-facing description stays generic.
pub fn server_error(description: &str, cause: &dyn std::fmt::Display) -> Response {
    error!(error = %cause, "{description}");
    http_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::ServerError,
        description,
    )
}

/// Redirect an authorize-time error back to the client's redirect URI,
/// preserving `state`. Falls back to a body error if the URI does not parse.
pub fn redirect_auth_error(
    redirect_uri: &str,
    code: ErrorCode,
    description: &str,
    state: &str,
) -> Response {
    let Ok(mut url) = Url::parse(redirect_uri) else {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            "invalid redirect_uri",
        );
    };

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("error", code.as_str());
        if !description.is_empty() {
            query.append_pair("error_description", description);
        }
        if !state.is_empty() {
            query.append_pair("state", state);
        }
    }

    info!(
        error_code = code.as_str(),
        redirect_uri = %url,
        "Redirecting to client with error"
    );
    (StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response()
}

/// Write an RFC 6750 bearer error with a `WWW-Authenticate` header.
pub fn bearer_error(status: StatusCode, code: ErrorCode, description: &str) -> Response {
    let mut value = format!("Bearer error=\"{}\"", code.as_str());
    if !description.is_empty() {
        value.push_str(&format!(", error_description=\"{description}\""));
    }
    (status, [(header::WWW_AUTHENTICATE, value)]).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_wire_names() {
        assert_eq!(ErrorCode::InvalidRequest.as_str(), "invalid_request");
        assert_eq!(ErrorCode::AccessDenied.as_str(), "access_denied");
        assert_eq!(
            ErrorCode::UnsupportedGrantType.as_str(),
            "unsupported_grant_type"
        );
    }

    #[test]
    fn redirect_error_preserves_state() {
        let resp = redirect_auth_error(
            "https://rp.example.com/cb",
            ErrorCode::InvalidScope,
            "unsupported scope",
            "xyz",
        );
        assert_eq!(resp.status(), StatusCode::FOUND);
        let location = resp.headers()[header::LOCATION].to_str().unwrap();
        let url = Url::parse(location).unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(pairs.contains(&("error".to_string(), "invalid_scope".to_string())));
        assert!(pairs.contains(&("state".to_string(), "xyz".to_string())));
    }

    #[test]
    fn redirect_error_with_bad_uri_falls_back_to_body() {
        let resp = redirect_auth_error("::not a uri::", ErrorCode::InvalidScope, "", "s");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn bearer_error_sets_www_authenticate() {
        let resp = bearer_error(
            StatusCode::UNAUTHORIZED,
            ErrorCode::InvalidToken,
            "token expired",
        );
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let header = resp.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
        assert_eq!(
            header,
            "Bearer error=\"invalid_token\", error_description=\"token expired\""
        );
    }
}
