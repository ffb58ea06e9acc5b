//! HTTP router and handlers

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
};
use serde_json::{Value, json};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    services::{ServeDir, ServeFile},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, warn};

use super::auth::{AuthGate, auth_middleware, request_claims};
use crate::Result;
use crate::config::{Config, StaticFilesConfig};
use crate::oidc::TokenVerifier;
use crate::proxy::{ProxyError, ProxyTable, forward};

/// Shared application state
pub struct AppState {
    /// Proxy route table
    pub proxy: Arc<ProxyTable>,
    /// Bearer verification gate
    pub auth_gate: Arc<AuthGate>,
    /// Document served at `GET /config`
    pub frontend: Value,
    /// Upper bound for buffered request bodies
    pub max_body_size: usize,
    /// SPA assets
    pub static_files: StaticFilesConfig,
    /// Allow any origin
    pub permissive_cors: bool,
    /// Whole-request timeout
    pub request_timeout: Duration,
}

impl AppState {
    /// Build state from configuration; `verifier` is `None` when OIDC is off
    pub fn new(config: &Config, verifier: Option<Arc<TokenVerifier>>) -> Result<Self> {
        let proxy = Arc::new(ProxyTable::from_config(&config.proxy.routes)?);
        let auth_gate = Arc::new(AuthGate::new(
            verifier,
            config.auth.public_paths.clone(),
            Arc::clone(&proxy),
        ));

        Ok(Self {
            proxy,
            auth_gate,
            frontend: config.frontend.clone(),
            max_body_size: config.server.max_body_size,
            static_files: config.static_files.clone(),
            permissive_cors: config.server.permissive_cors,
            request_timeout: config.server.request_timeout,
        })
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let auth_gate = Arc::clone(&state.auth_gate);

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/config", get(config_handler));

    let mut root_route = false;
    for route in state.proxy.routes() {
        if route.prefix == "/" {
            root_route = true;
            continue;
        }
        // The catch-all does not match an empty remainder, so `{prefix}/` is mounted too
        router = router
            .route(&route.prefix, any(proxy_handler))
            .route(&format!("{}/", route.prefix), any(proxy_handler))
            .route(&format!("{}/{{*rest}}", route.prefix), any(proxy_handler));
    }

    // A "/" mount owns every unmatched path, so it replaces the static fallback
    router = if root_route {
        router.fallback(proxy_handler)
    } else if state.static_files.enabled {
        let root = PathBuf::from(&state.static_files.path);
        let index = root.join(&state.static_files.index);
        debug!(path = %root.display(), index = %index.display(), "Serving static files");
        router.fallback_service(ServeDir::new(root).fallback(ServeFile::new(index)))
    } else {
        router.fallback(not_found_handler)
    };

    let mut router = router
        // Authentication middleware (applied before other layers)
        .layer(middleware::from_fn_with_state(auth_gate, auth_middleware))
        .layer(DefaultBodyLimit::max(state.max_body_size))
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            state.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    if state.permissive_cors {
        router = router.layer(CorsLayer::permissive());
    }

    router.with_state(state)
}

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /config - frontend runtime configuration
async fn config_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.frontend.is_null() {
        Json(json!({}))
    } else {
        Json(state.frontend.clone())
    }
}

/// Any method under a proxy prefix
async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let path = request.uri().path().to_owned();
    let Some(route) = state.proxy.match_route(&path).cloned() else {
        return ProxyError::NoRoute(path).into_response();
    };

    let subject = request_claims(&request)
        .and_then(|c| c.subject())
        .map(str::to_owned);
    debug!(prefix = %route.prefix, path = %path, subject = ?subject, "Proxy request");

    match forward(&route, request, state.max_body_size).await {
        Ok(response) => response,
        Err(e) => {
            warn!(prefix = %route.prefix, path = %path, error = %e, "Proxy request failed");
            e.into_response()
        }
    }
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "message": "Not Found" })))
}
