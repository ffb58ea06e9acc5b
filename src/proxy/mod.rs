//! Reverse proxy: route table, body policies and upstream forwarding.
//!
//! Routes are declarative. A request is matched to the longest configured
//! prefix, its path is rewritten, the route's body policy is applied, and the
//! request is forwarded with the target's origin. The upstream response
//! (status, headers, body) is relayed unchanged; only transport failures are
//! turned into gateway errors.

mod forward;
mod rule;

use std::time::Duration;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

pub use forward::{apply_body_policy, forward, forwardable_headers, is_json};
pub use rule::{BodyPolicy, BodyRule, PathMatcher, ProxyRoute, ProxyTable, RewriteRule};

/// Request-local forwarding failures
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No route covers the path
    #[error("No proxy route for {0}")]
    NoRoute(String),

    /// Body exceeds `server.max_body_size`
    #[error("Request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    /// Path holds a dot segment that would escape the target base path
    #[error("Path {0} contains a dot segment")]
    InvalidPath(String),

    /// The route reconstructs JSON bodies and this one does not parse
    #[error("Invalid JSON body: {0}")]
    InvalidJsonBody(#[source] serde_json::Error),

    /// Upstream did not answer in time
    #[error("Upstream timed out after {0:?}")]
    Timeout(Duration),

    /// Upstream unreachable or the connection failed
    #[error("Upstream unavailable: {0}")]
    Upstream(#[source] reqwest::Error),
}

impl ProxyError {
    /// HTTP status returned to the caller
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoRoute(_) => StatusCode::NOT_FOUND,
            Self::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidPath(_) | Self::InvalidJsonBody(_) => StatusCode::BAD_REQUEST,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Self::NoRoute(_) => "Not Found",
            Self::BodyTooLarge(_) => "Payload Too Large",
            Self::InvalidPath(_) => "Bad Request",
            Self::InvalidJsonBody(_) => "Invalid JSON body",
            Self::Timeout(_) => "Gateway Timeout",
            Self::Upstream(_) => "Bad Gateway",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({
                "message": self.message(),
                "error": self.to_string(),
            })),
        )
            .into_response()
    }
}
