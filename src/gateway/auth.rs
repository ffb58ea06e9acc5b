//! Authentication middleware for the tenant gateway
//!
//! Protected requests must carry `Authorization: Bearer <jwt>`. A request is
//! protected when it falls under a proxy route with `require_auth` and is
//! not on a public path. Verified claims are inserted into the request
//! extensions as [`VerifiedClaims`].

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::oidc::{TokenVerifier, VerifiedClaims};
use crate::proxy::ProxyTable;

/// Request-local authentication failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No usable `Authorization: Bearer` header
    #[error("Unauthorized")]
    Missing,

    /// Token present but failed verification
    #[error("Invalid token: {0}")]
    Invalid(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = match &self {
            Self::Missing => json!({ "message": "Unauthorized" }),
            Self::Invalid(detail) => json!({ "message": "Invalid token", "error": detail }),
        };
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer")],
            Json(body),
        )
            .into_response()
    }
}

/// Decides which requests need a verified bearer token
pub struct AuthGate {
    verifier: Option<Arc<TokenVerifier>>,
    public_paths: Vec<String>,
    proxy: Arc<ProxyTable>,
}

impl AuthGate {
    /// `verifier` is `None` when OIDC is disabled
    #[must_use]
    pub fn new(
        verifier: Option<Arc<TokenVerifier>>,
        public_paths: Vec<String>,
        proxy: Arc<ProxyTable>,
    ) -> Self {
        Self {
            verifier,
            public_paths,
            proxy,
        }
    }

    /// Whether verification is active at all
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.verifier.is_some()
    }

    /// Check if a path is public (bypasses auth).
    ///
    /// Entries match on segment boundaries: `/config` covers `/config/x`,
    /// not `/configuration`.
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| {
            let p = p.trim_end_matches('/');
            p.is_empty()
                || path
                    .strip_prefix(p)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
    }

    /// Whether a request to `path` must carry a verified token
    #[must_use]
    pub fn requires_auth(&self, path: &str) -> bool {
        self.enabled()
            && !self.is_public_path(path)
            && self.proxy.match_route(path).is_some_and(|r| r.require_auth)
    }
}

/// Extract the bearer token from the `Authorization` header.
///
/// The scheme is case-insensitive; exactly one non-empty token must follow.
pub fn extract_bearer(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::Missing)?;

    let mut parts = value.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => Ok(token),
        _ => Err(AuthError::Missing),
    }
}

/// Authentication middleware
pub async fn auth_middleware(
    State(gate): State<Arc<AuthGate>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();

    let Some(verifier) = gate.verifier.as_ref().filter(|_| gate.requires_auth(&path)) else {
        return next.run(request).await;
    };

    let token = match extract_bearer(request.headers()) {
        Ok(token) => token.to_owned(),
        Err(e) => {
            warn!(path = %path, "Missing Authorization header");
            return e.into_response();
        }
    };

    match verifier.verify(&token).await {
        Ok(claims) => {
            debug!(subject = ?claims.subject(), path = %path, "Authenticated request");
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %path, error = %e, "Invalid token");
            AuthError::Invalid(e.to_string()).into_response()
        }
    }
}

/// Claims attached by [`auth_middleware`], if the request was verified
#[must_use]
pub fn request_claims<B>(request: &Request<B>) -> Option<&VerifiedClaims> {
    request.extensions().get::<VerifiedClaims>()
}
