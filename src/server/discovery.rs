//! Discovery endpoints
//!
//! OIDC provider metadata, RFC 8414 authorization-server metadata, and the
//! JWKS document. All three are public: CORS-open, OPTIONS-preflightable,
//! and pretty-printed with two-space indentation for human consumption.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use super::IdpServer;
use super::token::TOKEN_EXCHANGE_GRANT;
use crate::claims::PROTECTED_CLAIMS;

/// Partial OpenID Provider Metadata (OIDC Discovery 1.0)
#[derive(Debug, Serialize)]
struct OpenIdProviderMetadata {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    userinfo_endpoint: String,
    introspection_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    registration_endpoint: Option<String>,
    jwks_uri: String,
    scopes_supported: Vec<&'static str>,
    response_types_supported: Vec<&'static str>,
    subject_types_supported: Vec<&'static str>,
    claims_supported: Vec<&'static str>,
    id_token_signing_alg_values_supported: Vec<&'static str>,
    grant_types_supported: Vec<&'static str>,
    code_challenge_methods_supported: Vec<&'static str>,
}

/// OAuth 2.0 Authorization Server Metadata (RFC 8414)
#[derive(Debug, Serialize)]
struct OauthServerMetadata {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    introspection_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    registration_endpoint: Option<String>,
    jwks_uri: String,
    response_types_supported: Vec<&'static str>,
    grant_types_supported: Vec<&'static str>,
    scopes_supported: Vec<&'static str>,
    token_endpoint_auth_methods_supported: Vec<&'static str>,
    authorization_details_types_supported: Vec<&'static str>,
    resource_indicators_supported: bool,
    code_challenge_methods_supported: Vec<&'static str>,
}

fn grant_types(sts: bool) -> Vec<&'static str> {
    let mut grants = vec!["authorization_code", "refresh_token"];
    if sts {
        grants.push(TOKEN_EXCHANGE_GRANT);
    }
    grants
}

/// GET/OPTIONS /.well-known/openid-configuration
pub async fn openid_configuration(
    State(state): State<Arc<IdpServer>>,
    request: Request,
) -> Response {
    let (parts, _) = request.into_parts();
    if parts.method == Method::OPTIONS {
        return preflight();
    }

    let issuer = state.config.issuer();
    let metadata = OpenIdProviderMetadata {
        authorization_endpoint: format!("{issuer}/authorize"),
        token_endpoint: format!("{issuer}/token"),
        userinfo_endpoint: format!("{issuer}/userinfo"),
        introspection_endpoint: format!("{issuer}/introspect"),
        // The registration endpoint only exists for tailnet peers.
        registration_endpoint: (!super::is_funnel_request(&parts))
            .then(|| format!("{issuer}/register")),
        jwks_uri: format!("{issuer}/.well-known/jwks.json"),
        issuer,
        scopes_supported: super::SUPPORTED_SCOPES.to_vec(),
        response_types_supported: vec!["id_token", "code"],
        subject_types_supported: vec!["public"],
        claims_supported: PROTECTED_CLAIMS.to_vec(),
        id_token_signing_alg_values_supported: vec!["RS256"],
        grant_types_supported: grant_types(state.config.enable_sts),
        code_challenge_methods_supported: vec!["plain", "S256"],
    };
    pretty_json(&metadata)
}

/// GET/OPTIONS /.well-known/oauth-authorization-server
pub async fn oauth_metadata(State(state): State<Arc<IdpServer>>, request: Request) -> Response {
    let (parts, _) = request.into_parts();
    if parts.method == Method::OPTIONS {
        return preflight();
    }

    let issuer = state.config.issuer();
    let metadata = OauthServerMetadata {
        authorization_endpoint: format!("{issuer}/authorize"),
        token_endpoint: format!("{issuer}/token"),
        introspection_endpoint: format!("{issuer}/introspect"),
        registration_endpoint: (!super::is_funnel_request(&parts))
            .then(|| format!("{issuer}/register")),
        jwks_uri: format!("{issuer}/.well-known/jwks.json"),
        issuer,
        response_types_supported: vec!["id_token", "code"],
        grant_types_supported: grant_types(state.config.enable_sts),
        scopes_supported: super::SUPPORTED_SCOPES.to_vec(),
        token_endpoint_auth_methods_supported: vec!["client_secret_post", "client_secret_basic"],
        authorization_details_types_supported: vec!["resource_indicators"],
        resource_indicators_supported: true,
        code_challenge_methods_supported: vec!["plain", "S256"],
    };
    pretty_json(&metadata)
}

/// GET/OPTIONS /.well-known/jwks.json
pub async fn jwks(State(state): State<Arc<IdpServer>>, request: Request) -> Response {
    let (parts, _) = request.into_parts();
    if parts.method == Method::OPTIONS {
        return preflight();
    }
    pretty_json(state.key.jwks())
}

fn cors_headers() -> [(header::HeaderName, &'static str); 3] {
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS"),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
    ]
}

fn preflight() -> Response {
    (StatusCode::NO_CONTENT, cors_headers()).into_response()
}

fn pretty_json<T: Serialize>(value: &T) -> Response {
    match serde_json::to_string_pretty(value) {
        Ok(mut body) => {
            body.push('\n');
            (
                StatusCode::OK,
                cors_headers(),
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response()
        }
        Err(e) => super::error::server_error("failed to encode metadata", &e),
    }
}
