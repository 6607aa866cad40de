//! Gateway auth - request-time security core for a multi-tenant API gateway

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use gateway_auth::{
    cli::{Cli, Command},
    config::Config,
    gatekeeper::Gatekeeper,
    server, setup_tracing,
    store::{CacheStore, InMemoryCacheStore, InMemoryLockService, LockService, memory::spawn_reaper},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

/// Load configuration, apply CLI overrides and validate
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn run_check_config(cli: &Cli) -> ExitCode {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {e:#}");
            return ExitCode::FAILURE;
        }
    };

    // Secrets are printed as configured (`env:VAR` references), never resolved
    match serde_yaml::to_string(&config) {
        Ok(yaml) => {
            println!("✅ Configuration valid\n");
            print!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Failed to render configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(cli: &Cli) -> ExitCode {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        origin = %config.origin.base_url,
        "Starting gateway auth"
    );

    let cache = Arc::new(InMemoryCacheStore::new());
    let locks = Arc::new(InMemoryLockService::new());

    let gatekeeper = match Gatekeeper::from_config(
        &config,
        Arc::clone(&cache) as Arc<dyn CacheStore>,
        Arc::clone(&locks) as Arc<dyn LockService>,
    ) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gatekeeper: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let reaper = spawn_reaper(cache, locks, config.store.reap_interval, shutdown_tx.subscribe());

    // Warm the key cache; a cold origin only delays the first request
    let keys = gatekeeper.keys().clone();
    tokio::spawn(async move {
        match keys.refresh_all_keys().await {
            Ok(count) => info!(count, "Public keys preloaded"),
            Err(e) => tracing::warn!(error = %e, "Public key preload failed"),
        }
    });

    let result = server::serve(&config, gatekeeper, shutdown_tx).await;
    let _ = reaper.await;

    if let Err(e) = result {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway auth shutdown complete");
    ExitCode::SUCCESS
}
