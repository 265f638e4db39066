//! tsidp library
//!
//! An OpenID Connect identity provider and OAuth 2.0 authorization server
//! that derives end-user identity from a tailnet's peer-identity service.
//! The tailnet supplies "who is this connection?"; tsidp turns that into
//! signed ID tokens, opaque access/refresh tokens, and the discovery
//! documents relying parties expect.
//!
//! # Features
//!
//! - **Authorization-code flow** with PKCE (RFC 7636) and resource
//!   indicators (RFC 8707)
//! - **Refresh-token rotation** and RFC 8693 token exchange (optional)
//! - **RS256 ID tokens** signed with a persistent RSA key, published via JWKS
//! - **Extra claims** sourced from tailnet capability rules, with
//!   protected-claim enforcement
//! - **Dual-trust routing**: one HTTP surface, different behavior for
//!   tailnet peers versus public funnel traffic

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod claims;
pub mod cli;
pub mod clients;
pub mod config;
pub mod error;
pub mod grants;
pub mod identity;
pub mod keys;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
