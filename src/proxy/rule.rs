//! Declarative proxy routes: prefix matching, path rewriting, body policies.
//!
//! A route matches its prefix exactly or any path below it on a segment
//! boundary (`/api/traction` matches `/api/traction/foo`, not `/api/tractionx`).
//! Body rules are matched against the route-relative path, i.e. the path with
//! the mount prefix removed.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ProxyRouteConfig;
use crate::{Error, Result};

/// How the mount prefix is rewritten before forwarding
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteRule {
    /// `/api/traction/foo` -> `/foo`
    #[default]
    StripPrefix,
    /// `/api/traction/foo` -> `/v1/foo` with `Replace("/v1")`
    Replace(String),
}

/// Path matcher for body rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMatcher {
    /// Whole route-relative path equals the value
    Exact(String),
    /// Route-relative path starts with the value
    Prefix(String),
}

impl PathMatcher {
    /// Check a route-relative path
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(p) => path == p,
            Self::Prefix(p) => path.starts_with(p.as_str()),
        }
    }
}

/// What happens to the request body before it is forwarded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyPolicy {
    /// Parse a JSON body and re-serialize it
    #[default]
    Reconstruct,
    /// Forward the received bytes untouched
    Passthrough,
}

/// A `{matcher, policy}` pair; the first matching rule of a route wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyRule {
    /// Which route-relative paths this rule covers
    pub matcher: PathMatcher,
    /// Policy applied to matching requests
    pub policy: BodyPolicy,
}

/// A compiled proxy route with its own upstream client
#[derive(Debug)]
pub struct ProxyRoute {
    /// Mount prefix
    pub prefix: String,
    /// Upstream base URL
    pub target: Url,
    /// Prefix rewrite
    pub rewrite: RewriteRule,
    /// Whether bearer verification gates this route
    pub require_auth: bool,
    /// Upstream call timeout
    pub timeout: Duration,
    /// Body policy exceptions, in order
    pub body_rules: Vec<BodyRule>,
    /// Policy when no rule matches
    pub default_body_policy: BodyPolicy,
    pub(crate) client: reqwest::Client,
}

impl ProxyRoute {
    /// Compile a route from configuration
    pub fn from_config(config: &ProxyRouteConfig) -> Result<Self> {
        let target = Url::parse(&config.target)
            .map_err(|e| Error::Config(format!("Invalid proxy target {}: {e}", config.target)))?;

        // Zero disables following; the 3xx is relayed to the client
        let redirect = match config.max_redirects {
            0 => reqwest::redirect::Policy::none(),
            max => reqwest::redirect::Policy::limited(max),
        };

        // Encoded upstream bodies are relayed as-is, so no transparent decompression
        let client = reqwest::Client::builder()
            .redirect(redirect)
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            prefix: config.prefix.clone(),
            target,
            rewrite: config.rewrite.clone(),
            require_auth: config.require_auth,
            timeout: config.timeout,
            body_rules: config.body_rules.clone(),
            default_body_policy: config.default_body_policy,
            client,
        })
    }

    /// Whether `path` falls under this route's prefix
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return path.starts_with('/');
        }
        path.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    /// Path below the prefix, always starting with `/`
    #[must_use]
    pub fn relative_path<'a>(&self, path: &'a str) -> &'a str {
        if self.prefix == "/" {
            return path;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some("") | None => "/",
            Some(rest) => rest,
        }
    }

    /// Apply the rewrite rule to an inbound path
    #[must_use]
    pub fn rewrite_path(&self, path: &str) -> String {
        let relative = self.relative_path(path);
        match &self.rewrite {
            RewriteRule::StripPrefix => relative.to_string(),
            RewriteRule::Replace(with) => {
                let base = with.trim_end_matches('/');
                if base.is_empty() {
                    relative.to_string()
                } else if relative == "/" {
                    base.to_string()
                } else {
                    format!("{base}{relative}")
                }
            }
        }
    }

    /// Body policy for an inbound path
    #[must_use]
    pub fn body_policy(&self, path: &str) -> BodyPolicy {
        let relative = self.relative_path(path);
        self.body_rules
            .iter()
            .find(|rule| rule.matcher.matches(relative))
            .map_or(self.default_body_policy, |rule| rule.policy)
    }

    /// Full upstream URL for an inbound path and query.
    ///
    /// `None` when the route-relative path holds a `.` or `..` segment, raw or
    /// percent-encoded, since URL normalization would resolve it outside the
    /// target base path.
    #[must_use]
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> Option<Url> {
        if has_dot_segment(self.relative_path(path)) {
            return None;
        }
        let rewritten = self.rewrite_path(path);
        let base = self.target.path().trim_end_matches('/');

        let mut url = self.target.clone();
        if base.is_empty() {
            url.set_path(&rewritten);
        } else if rewritten == "/" {
            url.set_path(base);
        } else {
            url.set_path(&format!("{base}{rewritten}"));
        }
        url.set_query(query);
        Some(url)
    }
}

/// Whether a path has a segment that URL parsing treats as `.` or `..`
fn has_dot_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

/// Ordered set of proxy routes, matched by longest prefix
#[derive(Debug, Default)]
pub struct ProxyTable {
    routes: Vec<Arc<ProxyRoute>>,
}

impl ProxyTable {
    /// Compile every configured route
    pub fn from_config(routes: &[ProxyRouteConfig]) -> Result<Self> {
        let mut compiled = routes
            .iter()
            .map(|r| ProxyRoute::from_config(r).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        compiled.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(Self { routes: compiled })
    }

    /// Most specific route covering `path`
    #[must_use]
    pub fn match_route(&self, path: &str) -> Option<&Arc<ProxyRoute>> {
        self.routes.iter().find(|r| r.matches(path))
    }

    /// All routes, longest prefix first
    #[must_use]
    pub fn routes(&self) -> &[Arc<ProxyRoute>] {
        &self.routes
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
