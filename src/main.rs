//! Tenant Gateway - OIDC-authenticated reverse proxy for the tenant UI

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use tenant_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    log_shipping::LogShipper,
    proxy::ProxyTable,
    setup_tracing,
};

/// Upper bound on the final log flush at exit
const SHIP_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Configuration comes first: it decides whether logs are shipped
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::CheckConfig) => run_check_config(&config),
        Some(Command::Serve) | None => run_server(&cli, config).await,
    }
}

/// Load the config file and apply CLI overrides
fn load_config(cli: &Cli) -> tenant_gateway::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    if let Some(ref dir) = cli.static_dir {
        config.static_files.path = dir.display().to_string();
    }
    Ok(config)
}

/// Validate the configuration and print the effective route table
fn run_check_config(config: &Config) -> ExitCode {
    if let Err(e) = config.validate() {
        eprintln!("❌ Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }
    let table = match ProxyTable::from_config(&config.proxy.routes) {
        Ok(table) => table,
        Err(e) => {
            eprintln!("❌ Invalid proxy routes: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("✅ Configuration is valid\n");
    println!("Listen: {}:{}", config.server.host, config.server.port);
    if config.oidc.enabled {
        println!(
            "OIDC:   {} (algorithms {:?})",
            config.oidc.jwks_uri.as_deref().unwrap_or_default(),
            config.oidc.algorithms
        );
    } else {
        println!("OIDC:   disabled");
    }
    if config.static_files.enabled {
        println!("Static: {}", config.static_files.path);
    }

    println!("\nProxy routes ({}):", table.routes().len());
    for route in table.routes() {
        println!(
            "  {:<24} -> {}  auth={} timeout={:?} rewrite={:?} default_body={:?}",
            route.prefix,
            route.target,
            route.require_auth,
            route.timeout,
            route.rewrite,
            route.default_body_policy
        );
        for rule in &route.body_rules {
            println!("      {:?} => {:?}", rule.matcher, rule.policy);
        }
    }

    match serde_yaml::to_string(config) {
        Ok(yaml) => println!("\nEffective configuration:\n{yaml}"),
        Err(e) => eprintln!("Failed to render configuration: {e}"),
    }
    ExitCode::SUCCESS
}

/// Run the gateway server
async fn run_server(cli: &Cli, config: Config) -> ExitCode {
    let (shipper, ship_handle) = match config.logging.ship_endpoint.as_deref() {
        Some(endpoint) => match LogShipper::spawn(endpoint, &config.logging) {
            Ok((shipper, handle)) => (Some(shipper), Some(handle)),
            Err(e) => {
                eprintln!("Failed to start log shipping: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => (None, None),
    };
    let shipping = shipper.is_some();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format, shipper) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }
    if shipping {
        info!(endpoint = ?config.logging.ship_endpoint, "Log shipping enabled");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        routes = config.proxy.routes.len(),
        oidc = config.oidc.enabled,
        "Starting Tenant Gateway"
    );
    if !config.oidc.enabled {
        warn!("OIDC disabled: bearer tokens are not verified");
    }

    let code = match Gateway::new(config) {
        Ok(gateway) => match gateway.run().await {
            Ok(()) => {
                info!("Gateway shutdown complete");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Gateway error: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            error!("Failed to create gateway: {e}");
            ExitCode::FAILURE
        }
    };

    // The subscriber keeps the writer alive, so the last batch is flushed explicitly
    if let Some(handle) = ship_handle
        && !handle.finish(SHIP_FLUSH_TIMEOUT).await
    {
        eprintln!("Log shipping did not flush within {SHIP_FLUSH_TIMEOUT:?}");
    }
    code
}
