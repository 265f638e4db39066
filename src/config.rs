//! Configuration management

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Public HTTPS URL of this server (issuer); e.g. `https://idp.test.ts.net`
    pub server_url: String,
    /// Hostname used to qualify bare login-name hosts (`user@github` →
    /// `user@github.<hostname>`). Defaults to the `server_url` host.
    pub hostname: Option<String>,
    /// Enable RFC 8693 token exchange at the token endpoint
    pub enable_sts: bool,
    /// Behind a loopback reverse proxy: take the peer address from
    /// `X-Forwarded-For` instead of the socket address
    pub local_ts_mode: bool,
    /// Tailnet listener bind address
    pub listen_addr: String,
    /// Optional funnel listener bind address; requests accepted here are
    /// classified as public-internet traffic
    pub funnel_addr: Option<String>,
    /// Base URL of the overlay's local control channel (whois lookups)
    pub local_api_url: String,
    /// Directory holding the signing key and client registry
    pub state_dir: PathBuf,
    /// Access-token (and ID-token) lifetime
    #[serde(with = "humantime_serde")]
    pub access_token_ttl: Duration,
    /// Refresh-token lifetime; zero means refresh tokens never expire
    #[serde(with = "humantime_serde")]
    pub refresh_token_ttl: Duration,
    /// Peer-identity lookup timeout
    #[serde(with = "humantime_serde")]
    pub whois_timeout: Duration,
    /// Skip the admin-UI capability check. Test-only; never enable in
    /// production.
    pub bypass_admin_cap: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            hostname: None,
            enable_sts: false,
            local_ts_mode: false,
            listen_addr: "0.0.0.0:443".to_string(),
            funnel_addr: None,
            local_api_url: "http://local-tailscaled.sock".to_string(),
            state_dir: PathBuf::from("."),
            access_token_ttl: Duration::from_secs(5 * 60),
            refresh_token_ttl: Duration::from_secs(24 * 60 * 60),
            whois_timeout: Duration::from_secs(10),
            bypass_admin_cap: false,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (TSIDP_ prefix)
        figment = figment.merge(Env::prefixed("TSIDP_").split("__"));

        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate the configuration. Runs after CLI overrides are applied, so
    /// loading alone never rejects an incomplete file.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            return Err(Error::Config("server_url is required".to_string()));
        }
        let url = Url::parse(&self.server_url)
            .map_err(|e| Error::Config(format!("invalid server_url: {e}")))?;
        if url.host_str().is_none() {
            return Err(Error::Config("server_url must have a host".to_string()));
        }
        Ok(())
    }

    /// The issuer URL with any trailing slash removed
    #[must_use]
    pub fn issuer(&self) -> String {
        self.server_url.trim_end_matches('/').to_string()
    }

    /// Hostname for email qualification (explicit, or the server_url host)
    #[must_use]
    pub fn email_hostname(&self) -> String {
        if let Some(ref h) = self.hostname {
            return h.clone();
        }
        Url::parse(&self.server_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// Refresh-token expiry as an option; `None` means non-expiring
    #[must_use]
    pub fn refresh_ttl(&self) -> Option<Duration> {
        if self.refresh_token_ttl.is_zero() {
            None
        } else {
            Some(self.refresh_token_ttl)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            server_url: "https://idp.test.ts.net".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn default_ttls() {
        let config = Config::default();
        assert_eq!(config.access_token_ttl, Duration::from_secs(300));
        assert_eq!(config.refresh_token_ttl, Duration::from_secs(86400));
    }

    #[test]
    fn validate_requires_server_url() {
        let config = Config::default();
        assert!(config.validate().is_err());
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn issuer_strips_trailing_slash() {
        let config = Config {
            server_url: "https://idp.test.ts.net/".to_string(),
            ..Config::default()
        };
        assert_eq!(config.issuer(), "https://idp.test.ts.net");
    }

    #[test]
    fn email_hostname_falls_back_to_server_url_host() {
        let config = base_config();
        assert_eq!(config.email_hostname(), "idp.test.ts.net");

        let config = Config {
            hostname: Some("other.ts.net".to_string()),
            ..base_config()
        };
        assert_eq!(config.email_hostname(), "other.ts.net");
    }

    #[test]
    fn zero_refresh_ttl_means_non_expiring() {
        let config = Config {
            refresh_token_ttl: Duration::ZERO,
            ..base_config()
        };
        assert_eq!(config.refresh_ttl(), None);
        assert!(base_config().refresh_ttl().is_some());
    }
}
