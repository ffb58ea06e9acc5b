//! Shared harness: a fake upstream, a JWKS endpoint and a running gateway,
//! each on an ephemeral port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use tenant_gateway::config::{Config, ProxyRouteConfig};
use tenant_gateway::gateway::Gateway;
use tenant_gateway::proxy::{BodyPolicy, BodyRule, PathMatcher, RewriteRule};

pub const SIGNING_KEY: &[u8] = include_bytes!("../fixtures/signing_key.pem");
pub const FOREIGN_KEY: &[u8] = include_bytes!("../fixtures/foreign_key.pem");
pub const JWKS: &str = include_str!("../fixtures/jwks.json");
pub const KID: &str = "test-key-1";

/// Counts requests that reached a fake server
#[derive(Clone, Default)]
pub struct Hits(Arc<AtomicUsize>);

impl Hits {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn inc(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

/// Upstream that echoes each request as JSON.
///
/// `/old` redirects to `/new`, `/teapot` answers 418, `/slow` answers after
/// [`SLOW_RESPONSE`].
pub async fn spawn_upstream() -> (SocketAddr, Hits) {
    let hits = Hits::default();
    let app = Router::new()
        .route("/old", get(|| async { Redirect::to("/new") }))
        .route("/teapot", get(teapot))
        .route("/slow", get(slow))
        .fallback(echo)
        .with_state(hits.clone());
    (serve(app).await, hits)
}

pub const SLOW_RESPONSE: Duration = Duration::from_secs(2);

async fn slow(State(hits): State<Hits>) -> &'static str {
    hits.inc();
    tokio::time::sleep(SLOW_RESPONSE).await;
    "finally"
}

async fn teapot(State(hits): State<Hits>) -> Response {
    hits.inc();
    (
        StatusCode::IM_A_TEAPOT,
        [("x-upstream", "kettle")],
        "short and stout",
    )
        .into_response()
}

async fn echo(State(hits): State<Hits>, request: Request<Body>) -> Json<Value> {
    hits.inc();
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    let header_str = |name: header::HeaderName| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };

    Json(json!({
        "method": parts.method.as_str(),
        "path": parts.uri.path(),
        "query": parts.uri.query(),
        "host": header_str(header::HOST),
        "authorization": header_str(header::AUTHORIZATION),
        "forwarded_host": header_str(header::HeaderName::from_static("x-forwarded-host")),
        "body": String::from_utf8_lossy(&bytes),
    }))
}

/// JWKS endpoint serving the fixture key set at `/certs`
pub async fn spawn_jwks() -> (SocketAddr, Hits) {
    let hits = Hits::default();
    let app = Router::new()
        .route(
            "/certs",
            get(|State(hits): State<Hits>| async move {
                hits.inc();
                ([(header::CONTENT_TYPE, "application/json")], JWKS)
            }),
        )
        .with_state(hits.clone());
    (serve(app).await, hits)
}

/// Configuration mounting `upstream` at `/api/traction` with the token exception
pub fn gateway_config(upstream: SocketAddr, jwks: SocketAddr) -> Config {
    let mut config = Config::default();
    config.static_files.enabled = false;
    config.oidc.enabled = true;
    config.oidc.jwks_uri = Some(format!("http://{jwks}/certs"));
    config.oidc.require_https = false;
    config.frontend = json!({ "tenantProxyPath": "/api/traction" });
    config.proxy.routes.push(ProxyRouteConfig {
        prefix: "/api/traction".to_string(),
        target: format!("http://{upstream}"),
        rewrite: RewriteRule::StripPrefix,
        require_auth: true,
        timeout: Duration::from_secs(5),
        max_redirects: 10,
        body_rules: vec![BodyRule {
            matcher: PathMatcher::Exact("/tenant/token".to_string()),
            policy: BodyPolicy::Passthrough,
        }],
        default_body_policy: BodyPolicy::Reconstruct,
    });
    config
}

/// Start a gateway and return its base URL
pub async fn spawn_gateway(config: Config) -> String {
    let gateway = Gateway::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { gateway.serve(listener).await.unwrap() });
    format!("http://{addr}")
}

/// Sign a token valid for five minutes
pub fn sign_token(key: &[u8]) -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.to_string());
    jsonwebtoken::encode(
        &header,
        &json!({ "sub": "tenant-admin", "iat": now, "exp": now + 300 }),
        &EncodingKey::from_rsa_pem(key).unwrap(),
    )
    .unwrap()
}

pub fn bearer(key: &[u8]) -> String {
    format!("Bearer {}", sign_token(key))
}
