//! OIDC bearer token verification.
//!
//! [`TokenVerifier`] checks a JWT against the identity provider's published
//! key set, read through a process-wide [`JwksCache`]. On success the decoded
//! claims are returned as [`VerifiedClaims`], which the auth middleware
//! attaches to the request.

pub mod clock;
pub mod jwks;
mod verifier;

use serde::Serialize;
use serde_json::{Map, Value};

pub use clock::{Clock, ManualClock, SystemClock};
pub use jwks::{HttpKeySetSource, JwksCache, JwksCacheSettings, JwksCacheStats, KeySetSource, StaticKeySetSource};
pub use verifier::TokenVerifier;

/// Error variants for token verification failures.
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// JWT decode / signature / claim validation failed.
    #[error("JWT verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The token names no `kid` and the key set holds more than one key.
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` in the JWT header is not in the key set.
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// The key set entry cannot verify signatures.
    #[error("Unsupported key type for key ID: {0}")]
    UnsupportedKey(String),

    /// The token is signed with an algorithm outside the allow-list.
    #[error("Algorithm not allowed: {0:?}")]
    AlgorithmNotAllowed(jsonwebtoken::Algorithm),

    /// Network or HTTP error while fetching the JWKS.
    #[error("JWKS fetch error: {0}")]
    Http(#[from] reqwest::Error),

    /// The key source could not provide a key set.
    #[error("JWKS unavailable: {0}")]
    KeySetUnavailable(String),
}

/// Claims of a verified token, attached to the request extensions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct VerifiedClaims(Map<String, Value>);

impl VerifiedClaims {
    /// Wrap a decoded claim set
    #[must_use]
    pub fn new(claims: Map<String, Value>) -> Self {
        Self(claims)
    }

    /// A single claim
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// `sub` claim
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.get("sub").and_then(Value::as_str)
    }

    /// `iss` claim
    #[must_use]
    pub fn issuer(&self) -> Option<&str> {
        self.get("iss").and_then(Value::as_str)
    }

    /// All claims
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Take the claim map
    #[must_use]
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}
