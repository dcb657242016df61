use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parley_server::cli::{Cli, Command, ServeArgs};
use parley_server::client;
use parley_server::config::ServerConfig;
use parley_server::db::SqliteStore;
use parley_server::db::pool::{create_pool, run_migrations};
use parley_server::db::queries::users;
use parley_server::web::app_state::AppState;
use parley_server::web::router::serve;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_server(args).await,
        Command::Client(args) => client::run(args).await,
    }
}

async fn run_server(args: ServeArgs) -> Result<()> {
    // Load configuration (TOML file + env overrides)
    let mut config = ServerConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.address = listen;
    }

    // Initialize database
    let pool = create_pool(&config.database.url, config.database.max_connections)
        .await
        .context("failed to connect to database")?;

    run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;

    // No session survives a restart
    let reset = users::mark_all_offline(&pool)
        .await
        .context("failed to reset online status")?;
    if reset > 0 {
        info!(count = reset, "cleared stale online flags");
    }

    // Cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let store = Arc::new(SqliteStore::new(pool));
    let app_state = Arc::new(AppState::new(store, &config, cancel.clone()));

    let listener = tokio::net::TcpListener::bind(&config.server.address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.address))?;

    info!(
        address = %listener.local_addr()?,
        policy = ?config.routing.group_post_policy,
        queue_capacity = config.routing.outbound_queue_capacity,
        "Parley server starting"
    );

    // Cancel on Ctrl+C
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        info!("Shutdown signal received, stopping gracefully...");
        shutdown_cancel.cancel();
    });

    serve(listener, app_state, cancel).await.context("server error")?;

    info!("Parley server stopped");
    Ok(())
}
