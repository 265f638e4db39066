//! OAuth 2.0 token endpoint
//!
//! Grant types: `authorization_code` (with PKCE verification),
//! `refresh_token` (single-use rotation), and RFC 8693 token exchange when
//! enabled. Issues opaque hex access/refresh tokens and RS256 ID tokens.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::error::{ErrorCode, http_error, server_error};
use super::{IdpServer, constant_time_eq, form_value, form_values, parse_form, read_body};
use crate::claims;
use crate::clients::FunnelClient;
use crate::grants::{AuthRequest, hex_string};

/// RFC 8693 grant-type URN for token exchange
pub const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// RFC 8693 token-type URN for access tokens
pub const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

/// POST /token
pub async fn token(State(state): State<Arc<IdpServer>>, request: Request) -> Response {
    let (parts, body) = match read_body(request).await {
        Ok(read) => read,
        Err(e) => return server_error("failed to read request body", &e),
    };
    let form = parse_form(&body);

    let Some(grant_type) = form_value(&form, "grant_type") else {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            "must specify grant_type",
        );
    };

    match grant_type {
        "authorization_code" => authorization_code(&state, &parts, &form).await,
        "refresh_token" => refresh_token(&state, &parts, &form).await,
        TOKEN_EXCHANGE_GRANT => token_exchange(&state, &parts, &form),
        other => http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::UnsupportedGrantType,
            &format!("unsupported grant type: {other:?}"),
        ),
    }
}

async fn authorization_code(
    state: &IdpServer,
    parts: &Parts,
    form: &[(String, String)],
) -> Response {
    let Some(code) = form_value(form, "code") else {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            "must specify code",
        );
    };
    // Consumes the code: a second exchange with the same code fails even if
    // this one goes on to fail client auth.
    let Some(ar) = state.grants.take_code(code) else {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidGrant,
            "code not found or expired",
        );
    };

    if form_value(form, "redirect_uri") != Some(ar.redirect_uri.as_str()) {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidGrant,
            "redirect_uri mismatch",
        );
    }

    if let Err(resp) = verify_client_auth(state, parts, form, &ar) {
        return *resp;
    }

    // PKCE (RFC 7636): a challenge bound at authorize time must be answered.
    if let Some(ref challenge) = ar.code_challenge {
        let method = ar.code_challenge_method.as_deref().unwrap_or("plain");
        let Some(verifier) = form_value(form, "code_verifier") else {
            return http_error(
                StatusCode::BAD_REQUEST,
                ErrorCode::InvalidGrant,
                "code_verifier required",
            );
        };
        if !verify_pkce(challenge, method, verifier) {
            return http_error(
                StatusCode::BAD_REQUEST,
                ErrorCode::InvalidGrant,
                "invalid code_verifier",
            );
        }
    }

    issue_tokens(state, ar)
}

async fn refresh_token(state: &IdpServer, parts: &Parts, form: &[(String, String)]) -> Response {
    let Some(token) = form_value(form, "refresh_token") else {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            "must specify refresh_token",
        );
    };
    // Rotation: the old token is gone the moment it is redeemed.
    let Some(mut ar) = state.grants.take_refresh(token) else {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidGrant,
            "refresh token not found or expired",
        );
    };

    if let Err(resp) = verify_client_auth(state, parts, form, &ar) {
        return *resp;
    }

    // Best-effort: reconfirm the peer still resolves to the same identity
    // through its tailnet address. Lookup failure falls back to the snapshot
    // taken at authorize time.
    if let Some(addr) = ar.remote_user.addresses.first() {
        let bare = addr.split('/').next().unwrap_or(addr);
        match state.resolver.who_is(bare).await {
            Ok(identity) => ar.remote_user = identity,
            Err(e) => debug!(error = %e, "whois reconfirmation failed, using snapshot"),
        }
    }

    issue_tokens(state, ar)
}

fn token_exchange(state: &IdpServer, parts: &Parts, form: &[(String, String)]) -> Response {
    if !state.config.enable_sts {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::UnsupportedGrantType,
            "token exchange is not enabled",
        );
    }

    let Some(subject_token) = form_value(form, "subject_token") else {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            "must specify subject_token",
        );
    };
    if let Some(kind) = form_value(form, "subject_token_type") {
        if kind != ACCESS_TOKEN_TYPE {
            return http_error(
                StatusCode::BAD_REQUEST,
                ErrorCode::InvalidRequest,
                &format!("unsupported subject_token_type: {kind:?}"),
            );
        }
    }

    let Some(ar) = state.grants.lookup_access(subject_token) else {
        return http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidGrant,
            "subject_token not found or expired",
        );
    };

    if let Err(resp) = verify_client_auth(state, parts, form, &ar) {
        return *resp;
    }

    let mut exchanged = ar;
    let resources = form_values(form, "resource");
    if !resources.is_empty() {
        exchanged.resources = resources;
    }

    let ttl = state.config.access_token_ttl;
    let access_token = hex_string(32);
    exchanged.valid_till = Some(SystemTime::now() + ttl);
    exchanged.jti = uuid::Uuid::new_v4().to_string();
    let scope = exchanged.scopes.join(" ");
    state.grants.put_access(&access_token, exchanged);

    token_response(json!({
        "access_token": access_token,
        "issued_token_type": ACCESS_TOKEN_TYPE,
        "token_type": "Bearer",
        "expires_in": ttl.as_secs(),
        "scope": scope,
    }))
}

/// Issue the access/refresh pair (and ID token under the `openid` scope)
/// for a validated grant.
fn issue_tokens(state: &IdpServer, ar: AuthRequest) -> Response {
    let now = SystemTime::now();
    let ttl = state.config.access_token_ttl;

    let access_token = hex_string(32);
    let mut access_ar = ar.clone();
    access_ar.valid_till = Some(now + ttl);
    access_ar.jti = uuid::Uuid::new_v4().to_string();
    state.grants.put_access(&access_token, access_ar);

    let refresh_token = hex_string(32);
    let mut refresh_ar = ar.clone();
    refresh_ar.valid_till = state.config.refresh_ttl().map(|d| now + d);
    refresh_ar.jti = uuid::Uuid::new_v4().to_string();
    state.grants.put_refresh(&refresh_token, refresh_ar);

    let mut body = json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": ttl.as_secs(),
        "refresh_token": refresh_token,
        "scope": ar.scopes.join(" "),
    });

    if ar.scopes.iter().any(|s| s == "openid") {
        let claims = match id_token_claims(state, &ar, now) {
            Ok(claims) => claims,
            Err(resp) => return *resp,
        };
        match state.key.sign(&claims) {
            Ok(id_token) => {
                body["id_token"] = Value::String(id_token);
            }
            Err(e) => return server_error("failed to sign ID token", &e),
        }
    }

    token_response(body)
}

/// Build the ID-token claim set: standard OIDC claims, tailnet identity
/// claims, scope-gated profile claims, and capability extra claims.
fn id_token_claims(
    state: &IdpServer,
    ar: &AuthRequest,
    now: SystemTime,
) -> Result<Map<String, Value>, Box<Response>> {
    let user = &ar.remote_user;
    let now_secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let exp = now_secs + state.config.access_token_ttl.as_secs();

    let mut base = Map::new();
    base.insert("iss".to_string(), json!(state.config.issuer()));
    base.insert("sub".to_string(), json!(user.user_id));
    base.insert("aud".to_string(), audiences(ar));
    base.insert("exp".to_string(), json!(exp));
    base.insert("iat".to_string(), json!(now_secs));
    base.insert("jti".to_string(), json!(uuid::Uuid::new_v4().to_string()));
    if !ar.nonce.is_empty() {
        base.insert("nonce".to_string(), json!(ar.nonce));
    }

    // Tailnet identity claims; all protected from capability overrides.
    base.insert("nid".to_string(), json!(user.node_id));
    base.insert("node".to_string(), json!(user.node_name));
    base.insert("tailnet".to_string(), json!(user.tailnet));
    if !user.addresses.is_empty() {
        base.insert("addresses".to_string(), json!(user.addresses));
    }
    if !user.node_key.is_empty() {
        base.insert("key".to_string(), json!(user.node_key));
    }

    if user.tagged {
        base.insert("tags".to_string(), json!(user.tags));
    } else {
        base.insert("user".to_string(), json!(user.login_name));
        base.insert("uid".to_string(), json!(user.user_id));

        if ar.scopes.iter().any(|s| s == "email") {
            base.insert(
                "email".to_string(),
                json!(state.realish_email(&user.login_name)),
            );
        }
        if ar.scopes.iter().any(|s| s == "profile") {
            if !user.display_name.is_empty() {
                base.insert("name".to_string(), json!(user.display_name));
            }
            if !user.profile_pic_url.is_empty() {
                base.insert("picture".to_string(), json!(user.profile_pic_url));
            }
            if let Some((username, _)) = user.login_name.split_once('@') {
                base.insert("username".to_string(), json!(username));
            }
        }
    }

    let rules = user
        .cap_rules()
        .map_err(|e| Box::new(http_error(StatusCode::BAD_REQUEST, ErrorCode::InvalidRequest, &e.to_string())))?;
    claims::with_extra_claims(base, &claims::rules_for_id_token(&rules)).map_err(|e| {
        Box::new(http_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            &e.to_string(),
        ))
    })
}

/// The `aud` claim: the client plus every RFC 8707 resource. A single
/// audience is emitted as a string, multiple as an array.
pub(crate) fn audiences(ar: &AuthRequest) -> Value {
    let mut audiences = vec![ar.client_id.clone()];
    for resource in &ar.resources {
        if !audiences.contains(resource) {
            audiences.push(resource.clone());
        }
    }
    if audiences.len() == 1 {
        Value::String(audiences.remove(0))
    } else {
        json!(audiences)
    }
}

/// Client credentials presented with a client-authenticated request.
pub(crate) struct ClientCredentials {
    pub(crate) id: String,
    pub(crate) secret: String,
}

/// Extract `client_secret_basic` or `client_secret_post` credentials.
pub(crate) fn client_credentials(
    parts: &Parts,
    form: &[(String, String)],
) -> Option<ClientCredentials> {
    if let Some(value) = parts.headers.get(header::AUTHORIZATION) {
        if let Some(encoded) = value.to_str().ok().and_then(|v| v.strip_prefix("Basic ")) {
            let decoded = STANDARD.decode(encoded).ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (id, secret) = decoded.split_once(':')?;
            return Some(ClientCredentials {
                id: id.to_string(),
                secret: secret.to_string(),
            });
        }
    }
    match (
        form_value(form, "client_id"),
        form_value(form, "client_secret"),
    ) {
        (Some(id), Some(secret)) => Some(ClientCredentials {
            id: id.to_string(),
            secret: secret.to_string(),
        }),
        _ => None,
    }
}

/// Enforce client authentication for a grant.
///
/// Credentials are mandatory when the grant belongs to a registered funnel
/// client or the request itself arrived over the funnel; they are accepted
/// (and still verified) when a tailnet-local caller volunteers them. All
/// comparisons are constant time.
fn verify_client_auth(
    state: &IdpServer,
    parts: &Parts,
    form: &[(String, String)],
    ar: &AuthRequest,
) -> Result<(), Box<Response>> {
    let creds = client_credentials(parts, form);
    let over_funnel = super::is_funnel_request(parts);
    let required = over_funnel || ar.funnel_rp.is_some();

    let Some(creds) = creds else {
        if required {
            return Err(Box::new(http_error(
                StatusCode::UNAUTHORIZED,
                ErrorCode::InvalidClient,
                "client authentication required",
            )));
        }
        return Ok(());
    };

    // The expected client is the one bound to the grant; a grant without a
    // funnel RP validates against the registry instead.
    let expected: Option<FunnelClient> = ar
        .funnel_rp
        .clone()
        .or_else(|| state.clients.get(&creds.id));

    let ok = expected.is_some_and(|client| {
        constant_time_eq(&creds.id, &client.id) && constant_time_eq(&creds.secret, &client.secret)
    });
    if !ok {
        return Err(Box::new(http_error(
            StatusCode::UNAUTHORIZED,
            ErrorCode::InvalidClient,
            "invalid client credentials",
        )));
    }
    Ok(())
}

/// Verify a PKCE verifier against the challenge bound at authorize time.
#[must_use]
pub fn verify_pkce(challenge: &str, method: &str, verifier: &str) -> bool {
    match method {
        "plain" => constant_time_eq(challenge, verifier),
        "S256" => {
            let digest = Sha256::digest(verifier.as_bytes());
            constant_time_eq(challenge, &URL_SAFE_NO_PAD.encode(digest))
        }
        _ => false,
    }
}

/// Token responses must never be cached (RFC 6749 §5.1).
fn token_response(body: Value) -> Response {
    (
        StatusCode::OK,
        [(header::CACHE_CONTROL, "no-store")],
        Json(body),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    // =====================================================================
    // verify_pkce
    // =====================================================================

    #[test]
    fn s256_roundtrip_law() {
        // Verifiers across the RFC 7636 length range (43..=128).
        for len in [43usize, 64, 128] {
            let verifier: String = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"
                .chars()
                .cycle()
                .take(len)
                .collect();
            let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
            assert!(verify_pkce(&challenge, "S256", &verifier));
            assert!(!verify_pkce(&challenge, "S256", "wrong-verifier"));
        }
    }

    #[test]
    fn plain_compares_verbatim() {
        assert!(verify_pkce("abc", "plain", "abc"));
        assert!(!verify_pkce("abc", "plain", "abd"));
        assert!(!verify_pkce("abc", "plain", "abcd"));
    }

    #[test]
    fn unknown_method_never_verifies() {
        assert!(!verify_pkce("abc", "S512", "abc"));
    }

    // =====================================================================
    // audiences
    // =====================================================================

    #[test]
    fn single_audience_is_a_string() {
        let ar = AuthRequest {
            client_id: "abc".to_string(),
            ..AuthRequest::default()
        };
        assert_eq!(audiences(&ar), json!("abc"));
    }

    #[test]
    fn resources_extend_audience() {
        let ar = AuthRequest {
            client_id: "abc".to_string(),
            resources: vec![
                "https://api.example.com".to_string(),
                "abc".to_string(), // duplicate of the client id
            ],
            ..AuthRequest::default()
        };
        assert_eq!(audiences(&ar), json!(["abc", "https://api.example.com"]));
    }

    // =====================================================================
    // client credential extraction
    // =====================================================================

    #[test]
    fn basic_auth_takes_precedence() {
        let encoded = STANDARD.encode("cid:csecret");
        let req = axum::http::Request::builder()
            .header(header::AUTHORIZATION, format!("Basic {encoded}"))
            .body(())
            .unwrap();
        let (parts, ()) = req.into_parts();
        let form = vec![
            ("client_id".to_string(), "other".to_string()),
            ("client_secret".to_string(), "other".to_string()),
        ];
        let creds = client_credentials(&parts, &form).unwrap();
        assert_eq!(creds.id, "cid");
        assert_eq!(creds.secret, "csecret");
    }

    #[test]
    fn post_credentials_when_no_header() {
        let req = axum::http::Request::builder().body(()).unwrap();
        let (parts, ()) = req.into_parts();
        let form = vec![
            ("client_id".to_string(), "cid".to_string()),
            ("client_secret".to_string(), "sec".to_string()),
        ];
        let creds = client_credentials(&parts, &form).unwrap();
        assert_eq!(creds.id, "cid");
        assert_eq!(creds.secret, "sec");

        assert!(client_credentials(&parts, &[]).is_none());
    }
}
