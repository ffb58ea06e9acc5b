//! Gateway server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use super::router::{AppState, create_router};
use crate::config::Config;
use crate::oidc::TokenVerifier;
use crate::{Error, Result};

/// Tenant gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared request state
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a new gateway
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let verifier = if config.oidc.enabled {
            let verifier = TokenVerifier::from_config(&config.oidc)?;
            info!(jwks_uri = %verifier.jwks_uri(), "OIDC verification configured");
            Some(Arc::new(verifier))
        } else {
            None
        };

        let state = Arc::new(AppState::new(&config, verifier)?);
        Ok(Self { config, state })
    }

    /// The HTTP application, without a listener
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Run the gateway on the configured address
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until a shutdown signal arrives
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let app = self.router();
        let local_addr = listener.local_addr()?;

        self.log_banner(local_addr);

        let shutdown_timeout = self.config.server.shutdown_timeout;
        let mut force_rx = shutdown_tx.subscribe();
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .into_future();

        // Graceful drain is bounded; after the timeout open connections are dropped
        let forced = async move {
            let _ = force_rx.recv().await;
            tokio::time::sleep(shutdown_timeout).await;
        };

        tokio::select! {
            result = server => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = forced => {
                warn!(timeout = ?shutdown_timeout, "Graceful shutdown timed out, dropping connections");
            }
        }

        info!("Gateway stopped");
        Ok(())
    }

    fn log_banner(&self, addr: SocketAddr) {
        info!("============================================================");
        info!("TENANT GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(address = %addr, "Listening");

        if self.state.auth_gate.enabled() {
            info!("AUTHENTICATION enabled (OIDC bearer tokens)");
        } else {
            warn!("AUTHENTICATION disabled - proxied routes are open to all requests");
        }

        if self.state.proxy.is_empty() {
            warn!("No proxy routes configured");
        }
        info!("Proxy routes:");
        for route in self.state.proxy.routes() {
            info!(
                "  {} -> {} (auth={}, timeout={:?})",
                route.prefix, route.target, route.require_auth, route.timeout
            );
        }

        if self.config.static_files.enabled {
            info!("Static files: {}", self.config.static_files.path);
        }
        info!("============================================================");
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
