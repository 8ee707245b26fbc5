use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use roster_core::tracing::init_logging;
use roster_core::{MemoryUserStore, UserStore};
use roster_http::{AppState, build_router, serve};
use roster_server::Settings;
use roster_sqlx::PgUserStore;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Roster - user directory API with request-correlated logging
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Address to bind, overrides the configured one
    #[arg(short = 'b', long = "bind")]
    bind: Option<SocketAddr>,

    /// Do not apply database migrations at startup
    #[arg(long)]
    skip_migrations: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        settings.server.bind_addr = bind;
    }
    if cli.skip_migrations {
        settings.database.run_migrations = false;
    }

    // Held until exit so buffered log lines and spans are flushed
    let _telemetry = init_logging(&settings.logging, &settings.telemetry)?;
    info!(
        environment = %settings.telemetry.environment,
        log_format = ?settings.logging.format,
        "Initializing {} v{}",
        settings.server.name,
        settings.telemetry.service_version
    );

    let users = open_store(&settings).await?;
    let state = AppState::new(users, settings.service_info());
    let router = build_router(state, settings.trace_config()?);

    let listener = TcpListener::bind(settings.server.bind_addr).await?;
    serve(listener, router, shutdown_signal()).await?;

    info!("Application shutdown");
    Ok(())
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn UserStore>> {
    let Some(url) = settings.database.url.as_deref() else {
        warn!("No database URL configured, users are kept in memory");
        return Ok(Arc::new(MemoryUserStore::new()));
    };

    let store = PgUserStore::connect(url, settings.database.max_connections).await?;
    match store.server_version().await {
        Ok(version) => info!(version = %version, "Connected to database"),
        Err(e) => warn!(error = %e, "Could not read database server version"),
    }

    if settings.database.run_migrations {
        info!("Running database migrations");
        match store.migrate().await {
            Ok(()) => info!("Database migrations completed successfully"),
            // Serving continues; requests touching the schema will fail
            Err(e) => error!(error = %e, "Failed to run migrations"),
        }
    }

    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
