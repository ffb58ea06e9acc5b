//! Bearer token verification against a remote JWKS.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to read `alg` and `kid`.
//! 2. Reject algorithms outside the configured allow-list.
//! 3. Look the key up in the cached JWKS; an unknown `kid` triggers one
//!    (throttled) refresh before failing.
//! 4. Verify the signature and `exp` / `nbf` (with leeway), plus `iss` when
//!    an issuer is configured.
//! 5. Check `aud` against the configured audiences, if any.

use std::sync::Arc;

use jsonwebtoken::{
    Algorithm, DecodingKey, TokenData, Validation,
    jwk::{AlgorithmParameters, Jwk, JwkSet},
};
use serde_json::{Map, Value};
use tracing::debug;

use super::clock::{Clock, SystemClock};
use super::jwks::{HttpKeySetSource, JwksCache, JwksCacheSettings};
use super::{OidcError, VerifiedClaims};
use crate::config::OidcConfig;
use crate::{Error, Result};

/// Verifies bearer tokens issued by one identity provider
pub struct TokenVerifier {
    cache: Arc<JwksCache>,
    jwks_uri: String,
    issuer: Option<String>,
    audiences: Vec<String>,
    algorithms: Vec<Algorithm>,
    leeway_secs: u64,
}

impl TokenVerifier {
    /// Create a verifier that reads keys through `cache`
    pub fn new(config: &OidcConfig, cache: Arc<JwksCache>) -> Result<Self> {
        let jwks_uri = config
            .jwks_uri
            .clone()
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| Error::config("oidc.jwks_uri is required"))?;

        Ok(Self {
            cache,
            jwks_uri,
            issuer: config.issuer.clone().filter(|issuer| !issuer.is_empty()),
            audiences: config.audiences.clone(),
            algorithms: config.algorithms.clone(),
            leeway_secs: config.leeway_secs,
        })
    }

    /// Create a verifier backed by an HTTP key source and the system clock
    pub fn from_config(config: &OidcConfig) -> Result<Self> {
        let source = HttpKeySetSource::new(config.require_https, config.fetch_timeout)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = JwksCache::new(Arc::new(source), clock, JwksCacheSettings::from(config));
        Self::new(config, Arc::new(cache))
    }

    /// The shared key-set cache
    pub fn cache(&self) -> &Arc<JwksCache> {
        &self.cache
    }

    /// Configured JWKS URI
    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// Verify `token` and return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError`] if the token is malformed, expired, signed with an
    /// unknown or unusable key, uses a disallowed algorithm, or fails the
    /// issuer/audience checks.
    pub async fn verify(&self, token: &str) -> std::result::Result<VerifiedClaims, OidcError> {
        let header = jsonwebtoken::decode_header(token)?;
        if !self.algorithms.contains(&header.alg) {
            return Err(OidcError::AlgorithmNotAllowed(header.alg));
        }

        let decoding_key = self.find_decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway_secs;
        validation.validate_nbf = true;
        // Audience is checked below to accept both string and array forms
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        let token_data: TokenData<Map<String, Value>> =
            jsonwebtoken::decode(token, &decoding_key, &validation)?;
        let claims = token_data.claims;

        if !self.audiences.is_empty() {
            check_audience(claims.get("aud").unwrap_or(&Value::Null), &self.audiences)?;
        }

        Ok(VerifiedClaims::new(claims))
    }

    /// Find a decoding key, refreshing the JWKS once if it is not there
    async fn find_decoding_key(&self, kid: Option<&str>) -> std::result::Result<DecodingKey, OidcError> {
        let jwks = self.cache.get(&self.jwks_uri, false).await?;
        if let Some(jwk) = select_jwk(&jwks, kid) {
            return decoding_key(jwk);
        }

        debug!(kid = ?kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.cache.get(&self.jwks_uri, true).await?;
        match (select_jwk(&jwks, kid), kid) {
            (Some(jwk), _) => decoding_key(jwk),
            (None, Some(kid)) => Err(OidcError::UnknownKeyId(kid.to_string())),
            (None, None) => Err(OidcError::MissingKeyId),
        }
    }
}

/// Pick the JWK for `kid`; a token without `kid` may use a single-key set
fn select_jwk<'a>(jwks: &'a JwkSet, kid: Option<&str>) -> Option<&'a Jwk> {
    match kid {
        Some(kid) => jwks.find(kid),
        None if jwks.keys.len() == 1 => jwks.keys.first(),
        None => None,
    }
}

/// Convert an asymmetric JWK into a `DecodingKey`
fn decoding_key(jwk: &Jwk) -> std::result::Result<DecodingKey, OidcError> {
    let kid = jwk.common.key_id.clone().unwrap_or_default();
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => Ok(DecodingKey::from_rsa_components(&rsa.n, &rsa.e)?),
        AlgorithmParameters::EllipticCurve(ec) => Ok(DecodingKey::from_ec_components(&ec.x, &ec.y)?),
        // Shared secrets have no business in a published key set
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => {
            Err(OidcError::UnsupportedKey(kid))
        }
    }
}

/// Validate that the token's `aud` claim contains one of the expected audiences
fn check_audience(aud_claim: &Value, expected: &[String]) -> std::result::Result<(), OidcError> {
    let matches = match aud_claim {
        Value::String(s) => expected.iter().any(|e| e == s),
        Value::Array(arr) => arr
            .iter()
            .any(|v| v.as_str().is_some_and(|s| expected.iter().any(|e| e == s))),
        _ => false,
    };

    if matches {
        Ok(())
    } else {
        Err(OidcError::Jwt(jsonwebtoken::errors::Error::from(
            jsonwebtoken::errors::ErrorKind::InvalidAudience,
        )))
    }
}
