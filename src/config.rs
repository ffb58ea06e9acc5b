//! Configuration management

use std::{collections::HashSet, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::proxy::{BodyPolicy, BodyRule, RewriteRule};
use crate::{Error, Result};

/// Prefix for environment variable overrides (`TENANT_GATEWAY_SERVER__PORT=9000`)
pub const ENV_PREFIX: &str = "TENANT_GATEWAY_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Static SPA assets
    pub static_files: StaticFilesConfig,
    /// OIDC bearer verification
    pub oidc: OidcConfig,
    /// Auth gate configuration
    pub auth: AuthConfig,
    /// Reverse proxy routes
    pub proxy: ProxyConfig,
    /// Frontend runtime configuration, served verbatim at `GET /config`
    pub frontend: serde_json::Value,
    /// Log shipping
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Allow any origin (development only)
    pub permissive_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
            permissive_cors: false,
        }
    }
}

/// Static asset serving for the single-page application
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticFilesConfig {
    /// Serve static files at all
    pub enabled: bool,
    /// Directory holding the built SPA
    pub path: String,
    /// File served for unknown paths so client-side routes resolve
    pub index: String,
}

impl Default for StaticFilesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "dist".to_string(),
            index: "index.html".to_string(),
        }
    }
}

/// OIDC bearer token verification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    /// Verify bearer tokens on protected routes
    pub enabled: bool,
    /// JWKS endpoint of the identity provider
    pub jwks_uri: Option<String>,
    /// Expected `iss` claim (unchecked when absent)
    pub issuer: Option<String>,
    /// Accepted `aud` values (unchecked when empty)
    pub audiences: Vec<String>,
    /// Accepted signing algorithms
    pub algorithms: Vec<jsonwebtoken::Algorithm>,
    /// Clock skew tolerance for `exp` / `nbf`
    pub leeway_secs: u64,
    /// Refuse to fetch the JWKS over plain HTTP
    pub require_https: bool,
    /// JWKS fetch timeout
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// How long a fetched key set is considered fresh
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Maximum number of cached key sets
    pub cache_max_entries: usize,
    /// Minimum spacing between forced refreshes triggered by unknown `kid`s
    #[serde(with = "humantime_serde")]
    pub min_refresh_interval: Duration,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            jwks_uri: None,
            issuer: None,
            audiences: Vec::new(),
            algorithms: vec![jsonwebtoken::Algorithm::RS256],
            leeway_secs: 60,
            require_https: true,
            fetch_timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(600),
            cache_max_entries: 16,
            min_refresh_interval: Duration::from_secs(30),
        }
    }
}

/// Authentication gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Paths that bypass authentication (prefix match)
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
}

fn default_public_paths() -> Vec<String> {
    vec!["/health".to_string(), "/config".to_string()]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            public_paths: default_public_paths(),
        }
    }
}

/// Reverse proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy routes, matched by longest prefix
    pub routes: Vec<ProxyRouteConfig>,
}

/// A single proxy mount point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRouteConfig {
    /// Mount path, e.g. `/api/traction`
    pub prefix: String,
    /// Upstream base URL
    pub target: String,
    /// Path rewrite applied before forwarding
    #[serde(default)]
    pub rewrite: RewriteRule,
    /// Gate this route behind bearer verification
    #[serde(default = "default_true")]
    pub require_auth: bool,
    /// Upstream call timeout
    #[serde(with = "humantime_serde", default = "default_route_timeout")]
    pub timeout: Duration,
    /// Upstream redirects followed before giving up
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Ordered body-policy exceptions; first match wins
    #[serde(default)]
    pub body_rules: Vec<BodyRule>,
    /// Policy when no rule matches
    #[serde(default)]
    pub default_body_policy: BodyPolicy,
}

fn default_true() -> bool {
    true
}

fn default_route_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_redirects() -> usize {
    10
}

/// Log shipping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// HTTP endpoint receiving JSON arrays of log events
    pub ship_endpoint: Option<String>,
    /// Events per POST
    pub batch_size: usize,
    /// Maximum time an event waits before being shipped
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Buffered events before new ones are dropped
    pub channel_capacity: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            ship_endpoint: None,
            batch_size: 100,
            flush_interval: Duration::from_secs(2),
            channel_capacity: 1024,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        Self::from_figment(&figment)
    }

    /// Extract from an already-assembled figment, then load env files and expand `${VAR}`
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Check cross-field invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.oidc.enabled && self.oidc.jwks_uri.as_deref().is_none_or(str::is_empty) {
            return Err(Error::config("oidc.enabled requires oidc.jwks_uri"));
        }
        if self.oidc.enabled && self.oidc.algorithms.is_empty() {
            return Err(Error::config("oidc.algorithms must not be empty"));
        }

        let mut seen = HashSet::new();
        for route in &self.proxy.routes {
            if !route.prefix.starts_with('/') || (route.prefix.len() > 1 && route.prefix.ends_with('/')) {
                return Err(Error::Config(format!(
                    "Proxy prefix must start with '/' and have no trailing '/': {}",
                    route.prefix
                )));
            }
            if !seen.insert(route.prefix.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate proxy prefix: {}",
                    route.prefix
                )));
            }
            let target = Url::parse(&route.target).map_err(|e| {
                Error::Config(format!("Invalid proxy target {}: {e}", route.target))
            })?;
            if !matches!(target.scheme(), "http" | "https") {
                return Err(Error::Config(format!(
                    "Proxy target must be http(s): {}",
                    route.target
                )));
            }
        }

        if self.logging.batch_size == 0 || self.logging.channel_capacity == 0 {
            return Err(Error::config(
                "logging.batch_size and logging.channel_capacity must be positive",
            ));
        }

        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in deployment-specific values
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for route in &mut self.proxy.routes {
            route.target = Self::expand_string(&re, &route.target);
        }
        for value in [
            &mut self.oidc.jwks_uri,
            &mut self.oidc.issuer,
            &mut self.logging.ship_endpoint,
        ]
        .into_iter()
        .flatten()
        {
            *value = Self::expand_string(&re, value);
        }
        self.static_files.path = Self::expand_string(&re, &self.static_files.path);

        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Humantime-style serde for `Duration` ("30s", "5m", "250ms")
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string (e.g. "30s", "5m", "100ms")
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" before "s" and "m"
        let (number, unit) = if let Some(ms) = s.strip_suffix("ms") {
            (ms, Unit::Millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, Unit::Secs(1))
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, Unit::Secs(60))
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, Unit::Secs(3600))
        } else {
            (s, Unit::Secs(1))
        };

        let value = number
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("Invalid duration {s:?}: {e}"))?;
        match unit {
            Unit::Millis => Ok(Duration::from_millis(value)),
            Unit::Secs(factor) => value
                .checked_mul(factor)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("Duration {s:?} is out of range")),
        }
    }

    enum Unit {
        Millis,
        Secs(u64),
    }
}
