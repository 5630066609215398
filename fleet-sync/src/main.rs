//! fleet-sync - telemetry pipeline service
//!
//! Polls the GPS provider, persists positions, pushes live updates to
//! socket clients and runs periodic consistency checks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_common::config::{prepare_root_folder, resolve_root_folder, TomlConfig};
use fleet_common::events::EventBus;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleet_sync::provider::HttpProviderClient;
use fleet_sync::rate_limiter::{RateLimiter, RateLimiterConfig};
use fleet_sync::session::SqliteSessionGateway;
use fleet_sync::settings::RuntimeSettings;
use fleet_sync::AppState;

/// Command-line arguments for fleet-sync
#[derive(Parser, Debug)]
#[command(name = "fleet-sync")]
#[command(about = "Fleet telemetry pipeline service")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "FLEET_SYNC_PORT")]
    port: Option<u16>,

    /// Root folder holding the database
    #[arg(short, long, env = "FLEET_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Bootstrap TOML configuration file
    #[arg(short, long, env = "FLEET_SYNC_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let toml_config = TomlConfig::load(args.config.as_deref()).context("Failed to load config")?;

    let default_filter = format!(
        "fleet_sync={level},fleet_common={level},tower_http=info",
        level = toml_config.logging.level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), &toml_config);
    let db_path = prepare_root_folder(&root_folder).context("Failed to prepare root folder")?;
    info!("Root folder: {}", root_folder.display());
    info!("Database: {}", db_path.display());

    let db = fleet_common::db::init_database(&db_path)
        .await
        .context("Failed to open database")?;
    let settings = RuntimeSettings::load(&db)
        .await
        .context("Failed to load runtime settings")?;

    let event_bus = EventBus::new(1000);
    let request_timeout = Duration::from_secs(toml_config.provider.request_timeout_secs);

    let limiter_config = RateLimiterConfig {
        base_delay_ms: settings.rate_limit_base_delay_ms,
        max_retries: settings.rate_limit_max_retries,
        circuit_breaker_threshold: settings.rate_limit_circuit_threshold,
    };
    let limiter_config = match limiter_config.validate() {
        Ok(()) => limiter_config,
        Err(e) => {
            warn!("Stored rate limiter settings rejected ({}), using defaults", e);
            RateLimiterConfig::default()
        }
    };
    let limiter = Arc::new(RateLimiter::new(limiter_config, request_timeout, event_bus.clone()));

    let provider = Arc::new(
        HttpProviderClient::new(&toml_config.provider.base_url, request_timeout)
            .context("Failed to build provider client")?,
    );
    info!("Provider: {}", toml_config.provider.base_url);

    let sessions = Arc::new(SqliteSessionGateway::new(
        db.clone(),
        provider.clone(),
        limiter.clone(),
    ));

    let state = AppState::new(db, event_bus, settings, provider, sessions, limiter);

    let cancel = CancellationToken::new();
    let tasks = state.spawn_background_tasks(&cancel);

    let app = fleet_sync::build_router(state);
    let port = args.port.unwrap_or(toml_config.port);
    let addr = format!("{}:{}", toml_config.bind_address, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
