//! Command-line interface definitions for `tsidp`.
//!
//! Defines the top-level [`Cli`] struct parsed by `clap`. There are no
//! subcommands; the binary always runs the server.

use std::path::PathBuf;

use clap::Parser;

/// Tailnet-backed OpenID Connect identity provider
///
/// Serves the OIDC/OAuth 2.0 endpoints over the tailnet (and optionally the
/// public funnel), translating authenticated peer identity into signed ID
/// tokens for relying parties.
#[derive(Parser, Debug)]
#[command(name = "tsidp")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file (YAML)
    #[arg(short, long, env = "TSIDP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Public HTTPS URL of this server (overrides config file)
    #[arg(long, env = "TSIDP_SERVER_URL")]
    pub server_url: Option<String>,

    /// Tailnet listener bind address (overrides config file)
    #[arg(long, env = "TSIDP_LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    /// Funnel listener bind address (overrides config file)
    #[arg(long, env = "TSIDP_FUNNEL_ADDR")]
    pub funnel_addr: Option<String>,

    /// Directory holding the signing key and client registry
    #[arg(long, env = "TSIDP_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Enable RFC 8693 token exchange
    #[arg(long)]
    pub enable_sts: bool,

    /// Take the peer address from X-Forwarded-For (behind a loopback proxy)
    #[arg(long)]
    pub local_ts_mode: bool,

    /// Minimum log level: trace, debug, info, warn, or error
    #[arg(long, default_value = "info", env = "TSIDP_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format: "text" for human-readable, "json" for structured
    #[arg(long, env = "TSIDP_LOG_FORMAT")]
    pub log_format: Option<String>,
}

impl Cli {
    /// Fold CLI overrides into a loaded configuration
    #[must_use]
    pub fn apply(&self, mut config: crate::config::Config) -> crate::config::Config {
        if let Some(ref url) = self.server_url {
            config.server_url = url.clone();
        }
        if let Some(ref addr) = self.listen_addr {
            config.listen_addr = addr.clone();
        }
        if let Some(ref addr) = self.funnel_addr {
            config.funnel_addr = Some(addr.clone());
        }
        if let Some(ref dir) = self.state_dir {
            config.state_dir = dir.clone();
        }
        if self.enable_sts {
            config.enable_sts = true;
        }
        if self.local_ts_mode {
            config.local_ts_mode = true;
        }
        config
    }
}
