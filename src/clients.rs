//! Client registry
//!
//! Persistent mapping of client id → funnel client (secret, name, redirect
//! URIs). Every mutation is write-through: the full registry is serialized
//! and durably stored before the call returns, and the in-memory change is
//! rolled back if the disk write fails.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::grants::hex_string;
use crate::{Error, Result};

/// File name of the persisted registry inside the state directory
const CLIENTS_FILE: &str = "oidc-funnel-clients.json";

/// A relying party registered for access over the public funnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelClient {
    /// Client identifier (32 hex chars)
    pub id: String,
    /// Client secret (64 hex chars)
    pub secret: String,
    /// Human-readable client name
    pub name: String,
    /// Registered redirect URIs; authorize matches these exactly
    pub redirect_uris: Vec<String>,
    /// Registration time
    pub created_at: SystemTime,
}

/// In-memory registry of funnel clients with write-through persistence.
pub struct ClientRegistry {
    path: PathBuf,
    clients: Mutex<HashMap<String, FunnelClient>>,
}

impl ClientRegistry {
    /// Load the registry from `state_dir`, starting empty if no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing registry file cannot be parsed.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CLIENTS_FILE);
        let clients = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)
                .map_err(|e| Error::Persist(format!("invalid registry file: {e}")))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            clients: Mutex::new(clients),
        })
    }

    /// Look up a client by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<FunnelClient> {
        self.clients.lock().get(id).cloned()
    }

    /// All registered clients, unsorted.
    #[must_use]
    pub fn list(&self) -> Vec<FunnelClient> {
        self.clients.lock().values().cloned().collect()
    }

    /// Insert or replace a client, persisting before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be persisted; the in-memory
    /// state is unchanged in that case.
    pub fn put(&self, client: FunnelClient) -> Result<()> {
        let id = client.id.clone();
        let (previous, snapshot) = {
            let mut clients = self.clients.lock();
            let previous = clients.insert(id.clone(), client);
            (previous, clients.clone())
        };

        if let Err(e) = self.persist(&snapshot) {
            let mut clients = self.clients.lock();
            match previous {
                Some(prev) => {
                    clients.insert(id, prev);
                }
                None => {
                    clients.remove(&id);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove a client, persisting before returning.
    ///
    /// Returns the removed client, or `None` if the id was unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be persisted; the client is
    /// restored in memory in that case.
    pub fn remove(&self, id: &str) -> Result<Option<FunnelClient>> {
        let (removed, snapshot) = {
            let mut clients = self.clients.lock();
            let removed = clients.remove(id);
            if removed.is_none() {
                return Ok(None);
            }
            (removed, clients.clone())
        };

        if let Err(e) = self.persist(&snapshot) {
            if let Some(ref client) = removed {
                self.clients.lock().insert(id.to_string(), client.clone());
            }
            return Err(e);
        }
        Ok(removed)
    }

    /// Register a new client with generated credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if any redirect URI is invalid or persistence fails.
    pub fn register(&self, name: &str, redirect_uris: Vec<String>) -> Result<FunnelClient> {
        if redirect_uris.is_empty() {
            return Err(Error::RedirectUri(
                "at least one redirect URI is required".to_string(),
            ));
        }
        for uri in &redirect_uris {
            if let Some(reason) = validate_redirect_uri(uri) {
                return Err(Error::RedirectUri(format!("{uri}: {reason}")));
            }
        }

        let client = FunnelClient {
            id: hex_string(32),
            secret: hex_string(64),
            name: name.to_string(),
            redirect_uris,
            created_at: SystemTime::now(),
        };
        self.put(client.clone())?;
        Ok(client)
    }

    fn persist(&self, snapshot: &HashMap<String, FunnelClient>) -> Result<()> {
        let data = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.path, &data).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Failed to persist client registry");
            Error::Persist(format!("failed to write registry: {e}"))
        })
    }
}

/// Write `data` to `path` through a temp file + rename, so readers never see
/// a partial file.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

/// Schemes that must never appear in a redirect URI. http/https are not
/// simply allowlisted because native apps register custom schemes.
fn is_dangerous_scheme(scheme: &str) -> bool {
    matches!(
        scheme,
        "ftp" | "file"
            | "mailto"
            | "javascript"
            | "data"
            | "blob"
            | "filesystem"
            | "vbscript"
            | "about"
            | "chrome"
            | "chrome-extension"
    )
}

/// Validate a redirect URI, returning `None` when acceptable and a
/// human-readable reason otherwise.
#[must_use]
pub fn validate_redirect_uri(redirect_uri: &str) -> Option<String> {
    match Url::parse(redirect_uri) {
        Ok(url) => {
            let scheme = url.scheme();
            if is_dangerous_scheme(scheme) {
                return Some(format!("scheme {scheme:?} is not allowed"));
            }
            if (scheme == "http" || scheme == "https")
                && url.host_str().unwrap_or("").is_empty()
            {
                return Some("HTTP and HTTPS URLs must have a host".to_string());
            }
            None
        }
        // The url crate rejects special-scheme URLs with an empty host
        // before our own host check can run.
        Err(url::ParseError::EmptyHost) => {
            Some("HTTP and HTTPS URLs must have a host".to_string())
        }
        Err(_) => Some("must be a valid URI with a scheme".to_string()),
    }
}
