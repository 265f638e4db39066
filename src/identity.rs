//! Peer-identity adapter
//!
//! Resolves an inbound request's source address into a [`PeerIdentity`]
//! through the overlay's local control channel, and extracts the capability
//! rules that drive extra claims and admin-UI access.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Peer capability carrying tsidp rules in the tailnet policy
pub const TSIDP_CAP: &str = "tailscale.com/cap/tsidp";

/// Identity of a tailnet peer, as reported by the overlay for a source
/// address. Snapshotted into each grant at authorize time; never mutated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Stable user identifier (ID-token `sub`)
    pub user_id: String,
    /// Stable node identifier
    pub node_id: String,
    /// Node DNS name
    pub node_name: String,
    /// Name of the tailnet the peer belongs to
    pub tailnet: String,
    /// Human display name
    pub display_name: String,
    /// Email-like login name
    pub login_name: String,
    /// Profile picture URL
    pub profile_pic_url: String,
    /// Node public key
    pub node_key: String,
    /// Tailnet addresses assigned to the node
    pub addresses: Vec<String>,
    /// Whether the node is tagged (no interactive user)
    pub tagged: bool,
    /// ACL tags on the node
    pub tags: Vec<String>,
    /// Capability map: capability name → raw rule documents
    pub cap_map: HashMap<String, Vec<Value>>,
}

impl PeerIdentity {
    /// Deserialize the tsidp capability rules attached to this peer.
    ///
    /// # Errors
    ///
    /// Returns an error when a rule document does not parse as a [`CapRule`].
    pub fn cap_rules(&self) -> Result<Vec<CapRule>> {
        let Some(raw) = self.cap_map.get(TSIDP_CAP) else {
            return Ok(Vec::new());
        };
        raw.iter()
            .map(|doc| {
                serde_json::from_value(doc.clone())
                    .map_err(|e| Error::Identity(format!("invalid capability rule: {e}")))
            })
            .collect()
    }

    /// Whether any capability rule grants access to the admin UI
    #[must_use]
    pub fn allows_admin_ui(&self) -> bool {
        self.cap_rules()
            .map(|rules| rules.iter().any(|r| r.allow_admin_ui))
            .unwrap_or(false)
    }
}

/// A single tsidp capability rule document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CapRule {
    /// Extra claims to merge into tokens: claim name → scalar or list
    #[serde(rename = "extraClaims")]
    pub extra_claims: HashMap<String, Value>,
    /// Include this rule's claims in /userinfo responses
    #[serde(rename = "includeInUserInfo")]
    pub include_in_user_info: bool,
    /// Include this rule's claims in ID tokens
    #[serde(rename = "includeInIDToken")]
    pub include_in_id_token: bool,
    /// Restrict the rule to specific RFC 8707 resources
    #[serde(rename = "resources")]
    pub resources: Vec<String>,
    /// Grant the peer access to the client-management UI
    #[serde(rename = "allowAdminUI")]
    pub allow_admin_ui: bool,
}

/// Resolves a request source address to a peer identity.
///
/// Implementations must be `Send + Sync` because the resolver is shared
/// across request tasks.
#[async_trait::async_trait]
pub trait PeerResolver: Send + Sync + 'static {
    /// Look up the peer behind `remote_addr` (an `ip:port` string).
    async fn who_is(&self, remote_addr: &str) -> Result<PeerIdentity>;
}

/// Peer resolver backed by the overlay's local control channel.
pub struct LocalApiResolver {
    base_url: String,
    client: reqwest::Client,
}

impl LocalApiResolver {
    /// Create a resolver against the local API at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl PeerResolver for LocalApiResolver {
    async fn who_is(&self, remote_addr: &str) -> Result<PeerIdentity> {
        let url = format!("{}/localapi/v0/whois", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("addr", remote_addr)])
            .send()
            .await
            .map_err(|e| Error::Identity(format!("whois request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Identity(format!(
                "whois returned HTTP {}",
                response.status()
            )));
        }

        let who: WhoIsResponse = response
            .json()
            .await
            .map_err(|e| Error::Identity(format!("invalid whois response: {e}")))?;
        Ok(who.into_identity())
    }
}

/// Wire shape of the local API's whois response
#[derive(Debug, Deserialize)]
struct WhoIsResponse {
    #[serde(rename = "Node")]
    node: WhoIsNode,
    #[serde(rename = "UserProfile", default)]
    user_profile: WhoIsUserProfile,
    #[serde(rename = "CapMap", default)]
    cap_map: HashMap<String, Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct WhoIsNode {
    #[serde(rename = "StableID", default)]
    stable_id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Key", default)]
    key: String,
    #[serde(rename = "Addresses", default)]
    addresses: Vec<String>,
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WhoIsUserProfile {
    #[serde(rename = "ID", default)]
    id: u64,
    #[serde(rename = "LoginName", default)]
    login_name: String,
    #[serde(rename = "DisplayName", default)]
    display_name: String,
    #[serde(rename = "ProfilePicURL", default)]
    profile_pic_url: String,
}

impl WhoIsResponse {
    fn into_identity(self) -> PeerIdentity {
        // The tailnet name is the node name minus its first label.
        let tailnet = self
            .node
            .name
            .trim_end_matches('.')
            .split_once('.')
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_default();

        PeerIdentity {
            user_id: self.user_profile.id.to_string(),
            node_id: self.node.stable_id,
            node_name: self.node.name.trim_end_matches('.').to_string(),
            tailnet,
            display_name: self.user_profile.display_name,
            login_name: self.user_profile.login_name,
            profile_pic_url: self.user_profile.profile_pic_url,
            node_key: self.node.key,
            addresses: self.node.addresses,
            tagged: !self.node.tags.is_empty(),
            tags: self.node.tags,
            cap_map: self.cap_map,
        }
    }
}

/// Peer resolver with a fixed address → identity table.
///
/// Used by the test suites and by local development setups that have no
/// overlay daemon to ask.
#[derive(Default)]
pub struct StaticResolver {
    peers: HashMap<String, PeerIdentity>,
}

impl StaticResolver {
    /// Create an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `identity` for lookups of `addr` (`ip:port` or bare IP).
    #[must_use]
    pub fn with_peer(mut self, addr: &str, identity: PeerIdentity) -> Self {
        self.peers.insert(addr.to_string(), identity);
        self
    }
}

#[async_trait::async_trait]
impl PeerResolver for StaticResolver {
    async fn who_is(&self, remote_addr: &str) -> Result<PeerIdentity> {
        // Accept both ip:port and bare-IP lookups.
        let bare = remote_addr.rsplit_once(':').map_or(remote_addr, |(ip, _)| ip);
        self.peers
            .get(remote_addr)
            .or_else(|| self.peers.get(bare))
            .cloned()
            .ok_or_else(|| Error::Identity(format!("no peer for {remote_addr}")))
    }
}
