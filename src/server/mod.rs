//! HTTP server, router, and trust gate
//!
//! One router serves every endpoint; trust is decided per request. Each
//! listener stamps requests with its [`ListenerKind`], and funnel
//! classification combines that stamp with the `Tailscale-Funnel-Request`
//! header. A request with neither signal is treated as funnel: the stamp is
//! only absent when a request bypassed a configured listener, and
//! misclassifying tailnet traffic as funnel fails safe while the reverse
//! does not.

pub mod authorize;
pub mod discovery;
pub mod error;
pub mod register;
pub mod token;
pub mod ui;
pub mod userinfo;

use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::Request;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{Extension, Router};
use tokio::net::TcpListener;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::info;

use crate::clients::ClientRegistry;
use crate::config::Config;
use crate::grants::{self, GrantStore};
use crate::identity::{PeerIdentity, PeerResolver};
use crate::keys::SigningKey;
use crate::{Error, Result};

/// Scopes this provider understands
pub const SUPPORTED_SCOPES: [&str; 3] = ["openid", "email", "profile"];

/// Header set by the overlay daemon on funneled requests
pub const FUNNEL_HEADER: &str = "Tailscale-Funnel-Request";

/// Which listener accepted a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// The tailnet-facing listener; peers are authenticated
    Tailnet,
    /// The funnel listener; the public internet
    Funnel,
}

/// Shared server state behind every handler
pub struct IdpServer {
    /// Validated configuration snapshot
    pub config: Config,
    /// Peer-identity resolver
    pub resolver: Arc<dyn PeerResolver>,
    /// Active signing key
    pub key: SigningKey,
    /// Funnel-client registry
    pub clients: ClientRegistry,
    /// Code/access/refresh grant store
    pub grants: Arc<GrantStore>,
}

impl IdpServer {
    /// Build the server: create the state directory, load or generate the
    /// signing key, and load the client registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or persisted state
    /// cannot be read.
    pub fn new(config: Config, resolver: Arc<dyn PeerResolver>) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.state_dir)?;
        let key = SigningKey::load_or_generate(&config.state_dir)?;
        let clients = ClientRegistry::load(&config.state_dir)?;
        Ok(Self {
            config,
            resolver,
            key,
            clients,
            grants: Arc::new(GrantStore::new()),
        })
    }

    /// Resolve the peer behind a request via the overlay.
    ///
    /// # Errors
    ///
    /// Returns an error when the source address cannot be determined or the
    /// whois lookup fails.
    pub async fn who_is(&self, parts: &Parts) -> Result<PeerIdentity> {
        let addr = remote_addr(&self.config, parts)
            .ok_or_else(|| Error::Identity("cannot determine source address".to_string()))?;
        self.resolver.who_is(&addr).await
    }

    /// Qualify an email-like login name whose host part has no dot by
    /// appending the server hostname (`user@github` → `user@github.<host>`).
    #[must_use]
    pub fn realish_email(&self, email: &str) -> String {
        realish_email(email, &self.config.email_hostname())
    }
}

/// See [`IdpServer::realish_email`].
fn realish_email(email: &str, hostname: &str) -> String {
    if let Some((user, host)) = email.split_once('@') {
        if !host.is_empty() && !host.contains('.') {
            return format!("{user}@{host}.{hostname}");
        }
    }
    email.to_string()
}

/// Whether a request arrived over the public funnel. Checks both the
/// overlay's funnel header and the accepting listener; either signal
/// classifies the request as funnel, and a missing listener stamp does too.
#[must_use]
pub fn is_funnel_request(parts: &Parts) -> bool {
    if parts.headers.contains_key(FUNNEL_HEADER) {
        return true;
    }
    match parts.extensions.get::<ListenerKind>() {
        Some(ListenerKind::Tailnet) => false,
        Some(ListenerKind::Funnel) | None => true,
    }
}

/// Source address of a request: `X-Forwarded-For` when running behind a
/// loopback proxy, the socket address otherwise.
#[must_use]
pub fn remote_addr(config: &Config, parts: &Parts) -> Option<String> {
    if config.local_ts_mode {
        return parts
            .headers
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string());
    }
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.to_string())
}

/// Constant-time string equality for client ids and secrets. Differing
/// lengths return false without inspecting contents, matching the usual
/// length-leak tradeoff of fixed-format credentials.
#[must_use]
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Parse an `application/x-www-form-urlencoded` body (or a raw query
/// string) into key/value pairs, preserving repeats.
#[must_use]
pub(crate) fn parse_form(input: &[u8]) -> Vec<(String, String)> {
    url::form_urlencoded::parse(input)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// First value for `key`, if any.
pub(crate) fn form_value<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Every value for `key`, in order.
pub(crate) fn form_values(pairs: &[(String, String)], key: &str) -> Vec<String> {
    pairs
        .iter()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .collect()
}

/// Create the router
pub fn router(state: Arc<IdpServer>) -> Router {
    Router::new()
        .route("/authorize", get(authorize::authorize))
        .route("/token", post(token::token))
        .route("/userinfo", get(userinfo::user_info))
        .route("/introspect", post(userinfo::introspect))
        .route("/register", post(register::register))
        .route(
            "/.well-known/openid-configuration",
            get(discovery::openid_configuration).options(discovery::openid_configuration),
        )
        .route(
            "/.well-known/oauth-authorization-server",
            get(discovery::oauth_metadata).options(discovery::oauth_metadata),
        )
        .route(
            "/.well-known/jwks.json",
            get(discovery::jwks).options(discovery::jwks),
        )
        .route("/", get(ui::clients_list))
        .route("/new", get(ui::new_client).post(ui::new_client))
        .route("/edit/{id}", get(ui::edit_client).post(ui::edit_client))
        .route("/style.css", get(ui::style_css))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the server until interrupted.
///
/// Binds the tailnet listener (and the funnel listener when configured),
/// stamping every accepted request with its [`ListenerKind`], and starts the
/// grant sweeper.
///
/// # Errors
///
/// Returns an error if a listener cannot be bound.
pub async fn run(state: Arc<IdpServer>) -> Result<()> {
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    grants::spawn_sweeper(Arc::clone(&state.grants), shutdown_tx.subscribe());

    let app = router(Arc::clone(&state));

    if let Some(ref funnel_addr) = state.config.funnel_addr {
        let funnel_app = app.clone().layer(Extension(ListenerKind::Funnel));
        let listener = TcpListener::bind(funnel_addr).await?;
        info!(addr = %funnel_addr, "Funnel listener bound");
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                funnel_app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "Funnel listener failed");
            }
        });
    }

    let tailnet_app = app.layer(Extension(ListenerKind::Tailnet));
    let listener = TcpListener::bind(&state.config.listen_addr).await?;
    info!(
        addr = %state.config.listen_addr,
        issuer = %state.config.issuer(),
        sts = state.config.enable_sts,
        "tsidp listening"
    );

    axum::serve(
        listener,
        tailnet_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let _ = shutdown_tx.send(());
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}

/// Extract parts and body bytes from a request, capping the body size.
pub(crate) async fn read_body(request: Request) -> Result<(Parts, Vec<u8>)> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, 1024 * 1024)
        .await
        .map_err(|e| Error::Internal(format!("failed to read body: {e}")))?;
    Ok((parts, bytes.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    fn parts_with(f: impl FnOnce(&mut HttpRequest<Body>)) -> Parts {
        let mut req = HttpRequest::builder().uri("/").body(Body::empty()).unwrap();
        f(&mut req);
        req.into_parts().0
    }

    // =====================================================================
    // funnel classification
    // =====================================================================

    #[test]
    fn funnel_header_wins_even_on_tailnet_listener() {
        let parts = parts_with(|req| {
            req.headers_mut()
                .insert(FUNNEL_HEADER, "1".parse().unwrap());
            req.extensions_mut().insert(ListenerKind::Tailnet);
        });
        assert!(is_funnel_request(&parts));
    }

    #[test]
    fn funnel_listener_classifies_as_funnel() {
        let parts = parts_with(|req| {
            req.extensions_mut().insert(ListenerKind::Funnel);
        });
        assert!(is_funnel_request(&parts));
    }

    #[test]
    fn tailnet_listener_without_header_is_trusted() {
        let parts = parts_with(|req| {
            req.extensions_mut().insert(ListenerKind::Tailnet);
        });
        assert!(!is_funnel_request(&parts));
    }

    #[test]
    fn missing_listener_stamp_fails_closed() {
        let parts = parts_with(|_| {});
        assert!(is_funnel_request(&parts));
    }

    // =====================================================================
    // remote address
    // =====================================================================

    #[test]
    fn local_ts_mode_uses_forwarded_for() {
        let config = Config {
            server_url: "https://idp.test.ts.net".to_string(),
            local_ts_mode: true,
            ..Config::default()
        };
        let parts = parts_with(|req| {
            req.headers_mut()
                .insert("X-Forwarded-For", "100.64.0.7, 10.0.0.1".parse().unwrap());
        });
        assert_eq!(remote_addr(&config, &parts), Some("100.64.0.7".to_string()));
    }

    #[test]
    fn socket_address_used_otherwise() {
        let config = Config {
            server_url: "https://idp.test.ts.net".to_string(),
            ..Config::default()
        };
        let parts = parts_with(|req| {
            req.extensions_mut()
                .insert(ConnectInfo("100.64.0.9:4242".parse::<SocketAddr>().unwrap()));
        });
        assert_eq!(
            remote_addr(&config, &parts),
            Some("100.64.0.9:4242".to_string())
        );
        let bare = parts_with(|_| {});
        assert_eq!(remote_addr(&config, &bare), None);
    }

    // =====================================================================
    // email qualification
    // =====================================================================

    #[test]
    fn bare_login_hosts_get_the_server_hostname() {
        assert_eq!(
            realish_email("test@github", "test.ts.net"),
            "test@github.test.ts.net"
        );
        assert_eq!(
            realish_email("test@passkey", "test.ts.net"),
            "test@passkey.test.ts.net"
        );
    }

    #[test]
    fn qualified_emails_pass_through() {
        assert_eq!(
            realish_email("alice@example.com", "test.ts.net"),
            "alice@example.com"
        );
        assert_eq!(realish_email("no-at-sign", "test.ts.net"), "no-at-sign");
    }

    // =====================================================================
    // form parsing
    // =====================================================================

    #[test]
    fn form_parsing_preserves_repeats() {
        let pairs = parse_form(b"a=1&resource=x&resource=y&b=%20z");
        assert_eq!(form_value(&pairs, "a"), Some("1"));
        assert_eq!(form_values(&pairs, "resource"), vec!["x", "y"]);
        assert_eq!(form_value(&pairs, "b"), Some(" z"));
        assert_eq!(form_value(&pairs, "missing"), None);
    }
}
