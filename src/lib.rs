//! Tenant Gateway Library
//!
//! Backend-for-frontend for a single-page tenant UI: serves the static
//! bundle, verifies OIDC bearer tokens and reverse-proxies API mounts to
//! their upstreams.
//!
//! # Features
//!
//! - **OIDC verification**: JWT signatures checked against a cached, bounded JWKS
//! - **Declarative proxy routes**: prefix rewrite, per-path body policies, redirects
//! - **SPA hosting**: static assets with an `index.html` fallback
//! - **Log shipping**: optional batching of JSON log events to an HTTP collector

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod log_shipping;
pub mod oidc;
pub mod proxy;

pub use error::{Error, Result};

use tracing_subscriber::{
    EnvFilter, Layer, filter::filter_fn, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::cli::LogFormat;
use crate::log_shipping::{LogShipper, ship_target_allowed};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`. When `shipper` is given, events
/// are also written as JSON to the shipping channel.
pub fn setup_tracing(level: &str, format: LogFormat, shipper: Option<LogShipper>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let ship_layer = shipper.map(|shipper| {
        fmt::layer()
            .json()
            .with_writer(shipper)
            .with_filter(filter_fn(ship_target_allowed))
    });

    let subscriber = tracing_subscriber::registry().with(filter).with(ship_layer);

    let result = match format {
        LogFormat::Json => subscriber.with(fmt::layer().json()).try_init(),
        LogFormat::Text => subscriber.with(fmt::layer()).try_init(),
    };

    result.map_err(|e| Error::Internal(format!("Failed to initialize tracing: {e}")))
}
