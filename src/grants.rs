//! Grant store
//!
//! In-memory maps from authorization codes, access tokens, and refresh
//! tokens to their [`AuthRequest`]. The three maps stay separate because
//! token strings are domain-partitioned and every caller knows which kind it
//! holds; one mutex covers all three so code consumption and refresh
//! rotation are atomic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rand::RngCore;
use tracing::debug;

use crate::clients::FunnelClient;
use crate::identity::PeerIdentity;

/// Authorization-code lifetime
pub const CODE_TTL: Duration = Duration::from_secs(5 * 60);

/// Sweep interval for expired grants
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Everything bound to a single grant: the peer identity snapshot taken at
/// authorize time plus the request parameters the token endpoint must
/// re-verify.
#[derive(Debug, Clone, Default)]
pub struct AuthRequest {
    /// Grant belongs to a tailnet-local RP (no registered funnel client)
    pub local_rp: bool,
    /// Client the grant was issued to
    pub client_id: String,
    /// Validated funnel client; `None` iff `local_rp`
    pub funnel_rp: Option<FunnelClient>,
    /// OIDC nonce to echo into the ID token
    pub nonce: String,
    /// Redirect URI bound at authorize time
    pub redirect_uri: String,
    /// Validated scopes (subset of openid/email/profile)
    pub scopes: Vec<String>,
    /// RFC 8707 resource audiences
    pub resources: Vec<String>,
    /// PKCE challenge, set iff the client initiated PKCE
    pub code_challenge: Option<String>,
    /// PKCE method (`plain` or `S256`), set iff `code_challenge` is
    pub code_challenge_method: Option<String>,
    /// Peer identity snapshot
    pub remote_user: PeerIdentity,
    /// Expiry; `None` means the grant never expires
    pub valid_till: Option<SystemTime>,
    /// Unique token id, reported by introspection
    pub jti: String,
}

impl AuthRequest {
    /// Whether the grant is expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.valid_till.is_some_and(|till| till < now)
    }
}

#[derive(Default)]
struct GrantMaps {
    codes: HashMap<String, AuthRequest>,
    access: HashMap<String, AuthRequest>,
    refresh: HashMap<String, AuthRequest>,
}

/// Shared store for authorization codes and issued tokens.
#[derive(Default)]
pub struct GrantStore {
    maps: Mutex<GrantMaps>,
}

impl GrantStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an authorization code.
    pub fn put_code(&self, code: &str, ar: AuthRequest) {
        self.maps.lock().codes.insert(code.to_string(), ar);
    }

    /// Consume an authorization code. Codes are single-use: the first take
    /// removes the entry, expired entries are dropped on access.
    #[must_use]
    pub fn take_code(&self, code: &str) -> Option<AuthRequest> {
        let ar = self.maps.lock().codes.remove(code)?;
        if ar.is_expired(SystemTime::now()) {
            return None;
        }
        Some(ar)
    }

    /// Store an access token.
    pub fn put_access(&self, token: &str, ar: AuthRequest) {
        self.maps.lock().access.insert(token.to_string(), ar);
    }

    /// Look up an access token without consuming it. Expired entries are
    /// evicted and reported as absent.
    #[must_use]
    pub fn lookup_access(&self, token: &str) -> Option<AuthRequest> {
        let mut maps = self.maps.lock();
        let ar = maps.access.get(token)?;
        if ar.is_expired(SystemTime::now()) {
            maps.access.remove(token);
            return None;
        }
        Some(ar.clone())
    }

    /// Look up an access token without consuming it or checking expiry.
    /// Callers that need to distinguish "unknown" from "expired" (the bearer
    /// error channel does) check expiry themselves and evict explicitly.
    #[must_use]
    pub fn peek_access(&self, token: &str) -> Option<AuthRequest> {
        self.maps.lock().access.get(token).cloned()
    }

    /// Evict an access token (expired-bearer cleanup).
    pub fn remove_access(&self, token: &str) {
        self.maps.lock().access.remove(token);
    }

    /// Store a refresh token.
    pub fn put_refresh(&self, token: &str, ar: AuthRequest) {
        self.maps.lock().refresh.insert(token.to_string(), ar);
    }

    /// Consume a refresh token. Removal and return are one critical
    /// section, so a rotated token can never be redeemed twice.
    #[must_use]
    pub fn take_refresh(&self, token: &str) -> Option<AuthRequest> {
        let ar = self.maps.lock().refresh.remove(token)?;
        if ar.is_expired(SystemTime::now()) {
            return None;
        }
        Some(ar)
    }

    /// Remove every entry whose expiry precedes `now` from all three maps.
    /// Entries without an expiry are kept.
    pub fn sweep(&self, now: SystemTime) {
        let mut maps = self.maps.lock();
        maps.codes.retain(|_, ar| !ar.is_expired(now));
        maps.access.retain(|_, ar| !ar.is_expired(now));
        maps.refresh.retain(|_, ar| !ar.is_expired(now));
    }

    /// Current entry counts (codes, access, refresh); used by tests and logs.
    #[must_use]
    pub fn len(&self) -> (usize, usize, usize) {
        let maps = self.maps.lock();
        (maps.codes.len(), maps.access.len(), maps.refresh.len())
    }

    /// Whether all three maps are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == (0, 0, 0)
    }
}

/// Spawn a background task that sweeps expired grants every
/// [`SWEEP_INTERVAL`]. The task exits when the `shutdown` receiver fires.
pub fn spawn_sweeper(store: Arc<GrantStore>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    store.sweep(SystemTime::now());
                }
                _ = shutdown.recv() => {
                    debug!("Grant sweeper shutting down");
                    break;
                }
            }
        }
    });
}

/// Generate `chars` hex characters of cryptographically random token
/// material. Used for authorization codes, opaque tokens, and client
/// credentials.
#[must_use]
pub fn hex_string(chars: usize) -> String {
    let mut bytes = vec![0u8; chars.div_ceil(2)];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut s = hex::encode(bytes);
    s.truncate(chars);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(valid_for: Option<Duration>) -> AuthRequest {
        AuthRequest {
            client_id: "test-client".to_string(),
            valid_till: valid_for.map(|d| SystemTime::now() + d),
            ..AuthRequest::default()
        }
    }

    fn expired_grant() -> AuthRequest {
        AuthRequest {
            client_id: "test-client".to_string(),
            valid_till: Some(SystemTime::now() - Duration::from_secs(3600)),
            ..AuthRequest::default()
        }
    }

    #[test]
    fn codes_are_single_use() {
        let store = GrantStore::new();
        store.put_code("c1", grant(Some(CODE_TTL)));

        assert!(store.take_code("c1").is_some());
        assert!(store.take_code("c1").is_none());
    }

    #[test]
    fn expired_code_is_not_returned() {
        let store = GrantStore::new();
        store.put_code("old", expired_grant());
        assert!(store.take_code("old").is_none());
        // And the expired entry is gone, not retryable.
        assert_eq!(store.len().0, 0);
    }

    #[test]
    fn access_lookup_does_not_consume() {
        let store = GrantStore::new();
        store.put_access("at1", grant(Some(Duration::from_secs(300))));
        assert!(store.lookup_access("at1").is_some());
        assert!(store.lookup_access("at1").is_some());
    }

    #[test]
    fn expired_access_is_evicted_on_lookup() {
        let store = GrantStore::new();
        store.put_access("stale", expired_grant());
        assert!(store.lookup_access("stale").is_none());
        assert_eq!(store.len().1, 0);
    }

    #[test]
    fn refresh_rotation_is_atomic() {
        let store = GrantStore::new();
        store.put_refresh("rt1", grant(None));

        assert!(store.take_refresh("rt1").is_some());
        assert!(store.take_refresh("rt1").is_none());
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let store = GrantStore::new();
        store.put_code("expired-code", expired_grant());
        store.put_code("valid-code", grant(Some(Duration::from_secs(3600))));
        store.put_access("expired-token", expired_grant());
        store.put_access("valid-token", grant(Some(Duration::from_secs(3600))));
        store.put_refresh("expired-refresh", expired_grant());
        store.put_refresh("valid-refresh", grant(None));
        store.put_refresh("valid-refresh-2", grant(Some(Duration::from_secs(86400))));

        store.sweep(SystemTime::now());

        assert_eq!(store.len(), (1, 1, 2));
        assert!(store.take_code("valid-code").is_some());
        assert!(store.lookup_access("valid-token").is_some());
        assert!(store.take_refresh("valid-refresh").is_some());
        assert!(store.take_refresh("valid-refresh-2").is_some());
    }

    #[test]
    fn non_expiring_refresh_survives_sweep() {
        let store = GrantStore::new();
        store.put_refresh("forever", grant(None));
        store.sweep(SystemTime::now() + Duration::from_secs(10 * 365 * 24 * 3600));
        assert!(store.take_refresh("forever").is_some());
    }

    #[test]
    fn hex_string_length_and_charset() {
        for len in [32, 64] {
            let s = hex_string(len);
            assert_eq!(s.len(), len);
            assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
        }
        // Two draws must differ.
        assert_ne!(hex_string(32), hex_string(32));
    }
}
