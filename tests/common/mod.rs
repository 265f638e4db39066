//! Shared test harness: an in-process server with a static peer table.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::Extension;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use tsidp::config::Config;
use tsidp::identity::{PeerIdentity, StaticResolver, TSIDP_CAP};
use tsidp::server::{IdpServer, ListenerKind, router};

/// Address whose peer is a plain user without capabilities
pub const ALICE_ADDR: &str = "100.64.0.1";
/// Address whose peer is a tagged (userless) node
pub const TAGGED_ADDR: &str = "100.64.0.2";
/// Address whose peer carries the given capability rules
pub const CAP_ADDR: &str = "100.64.0.3";

/// The plain test user
#[must_use]
pub fn alice() -> PeerIdentity {
    PeerIdentity {
        user_id: "UABC123".to_string(),
        node_id: "nNODE1".to_string(),
        node_name: "laptop.corp.ts.net".to_string(),
        tailnet: "corp.ts.net".to_string(),
        display_name: "Alice Example".to_string(),
        login_name: "alice@example.com".to_string(),
        profile_pic_url: "https://example.com/alice.png".to_string(),
        node_key: "nodekey:aa11".to_string(),
        addresses: vec![ALICE_ADDR.to_string()],
        ..PeerIdentity::default()
    }
}

fn tagged_node() -> PeerIdentity {
    PeerIdentity {
        user_id: "UTAGGED".to_string(),
        node_id: "nCI".to_string(),
        node_name: "ci.corp.ts.net".to_string(),
        tailnet: "corp.ts.net".to_string(),
        tagged: true,
        tags: vec!["tag:ci".to_string()],
        addresses: vec![TAGGED_ADDR.to_string()],
        ..PeerIdentity::default()
    }
}

/// Test-server handle: router plus direct access to the state
pub struct TestServer {
    /// Shared server state (registry, grants, key)
    pub state: Arc<IdpServer>,
    /// Router stamped as the tailnet listener
    pub app: Router,
    _state_dir: tempfile::TempDir,
}

/// Builder for [`TestServer`]
pub struct TestServerBuilder {
    enable_sts: bool,
    bypass_admin_cap: bool,
    cap_rules: Vec<Value>,
}

impl TestServerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            enable_sts: false,
            bypass_admin_cap: false,
            cap_rules: Vec::new(),
        }
    }

    #[must_use]
    pub fn enable_sts(mut self) -> Self {
        self.enable_sts = true;
        self
    }

    #[must_use]
    pub fn bypass_admin_cap(mut self) -> Self {
        self.bypass_admin_cap = true;
        self
    }

    /// Attach capability rules to the peer at [`CAP_ADDR`]
    #[must_use]
    pub fn cap_rules(mut self, rules: Vec<Value>) -> Self {
        self.cap_rules = rules;
        self
    }

    pub fn build(self) -> TestServer {
        let state_dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            server_url: "https://idp.test.ts.net".to_string(),
            state_dir: state_dir.path().to_path_buf(),
            // Tests drive source addresses through X-Forwarded-For.
            local_ts_mode: true,
            enable_sts: self.enable_sts,
            bypass_admin_cap: self.bypass_admin_cap,
            ..Config::default()
        };

        let mut capable = alice();
        capable.addresses = vec![CAP_ADDR.to_string()];
        let mut cap_map = HashMap::new();
        cap_map.insert(TSIDP_CAP.to_string(), self.cap_rules);
        capable.cap_map = cap_map;

        let resolver = StaticResolver::new()
            .with_peer(ALICE_ADDR, alice())
            .with_peer(TAGGED_ADDR, tagged_node())
            .with_peer(CAP_ADDR, capable);

        let state = Arc::new(IdpServer::new(config, Arc::new(resolver)).expect("server"));
        let app = router(Arc::clone(&state)).layer(Extension(ListenerKind::Tailnet));
        TestServer {
            state,
            app,
            _state_dir: state_dir,
        }
    }
}

impl Default for TestServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestServer {
    /// Register a funnel client with one redirect URI, returning (id, secret).
    pub fn register_client(&self, redirect_uri: &str) -> (String, String) {
        let client = self
            .state
            .clients
            .register("Test RP", vec![redirect_uri.to_string()])
            .expect("register client");
        (client.id, client.secret)
    }

    /// Send a request through the tailnet-stamped router.
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.expect("response")
    }
}

/// GET with a tailnet source address.
#[must_use]
pub fn get(uri: &str, from: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("X-Forwarded-For", from)
        .body(Body::empty())
        .expect("request")
}

/// POST an `application/x-www-form-urlencoded` body.
#[must_use]
pub fn post_form(uri: &str, from: &str, pairs: &[(&str, &str)]) -> Request<Body> {
    let mut body = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in pairs {
        body.append_pair(k, v);
    }
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("X-Forwarded-For", from)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(Body::from(body.finish()))
        .expect("request")
}

/// Collect a response body as JSON.
pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(json!(null))
}

/// Collect a response body as a string.
pub async fn body_string(response: Response<Body>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    String::from_utf8_lossy(&bytes).to_string()
}

/// Query parameters of a redirect's Location header.
#[must_use]
pub fn location_params(response: &Response<Body>) -> HashMap<String, String> {
    let location = response
        .headers()
        .get("location")
        .and_then(|v| v.to_str().ok())
        .expect("location header");
    let url = url::Url::parse(location).expect("location url");
    url.query_pairs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
