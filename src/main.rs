//! polykv server entry point
//!
//! Sets up logging, the storage engine and the expiry sweeper, then accepts
//! connections until Ctrl+C.

use anyhow::Context;
use polykv::commands::CommandHandler;
use polykv::config::{self, Config, Startup};
use polykv::connection::{handle_connection, ConnectionStats};
use polykv::storage::{ExpiryConfig, ExpirySweeper, StorageEngine};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn print_banner(config: &Config) {
    println!(
        r#"
polykv v{} - one in-memory store, four wire protocols
──────────────────────────────────────────────────────
Server started on {}
Speaking memcached, RESP, HTTP and Postgres on the same port.

Use Ctrl+C to shutdown gracefully.
"#,
        polykv::VERSION,
        config.bind_address()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match Config::load().context("invalid configuration")? {
        Startup::Run(config) => config,
        Startup::Help => {
            println!("{}", config::usage());
            return Ok(());
        }
        Startup::Version => {
            println!("polykv version {}", polykv::VERSION);
            return Ok(());
        }
    };

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .with_context(|| format!("invalid log level {:?}", config.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner(&config);

    // Shared across all connections
    let storage = Arc::new(StorageEngine::with_shards(config.shards));
    info!(shards = config.shards, "Storage engine initialized");

    let sweeper = ExpirySweeper::start(
        Arc::clone(&storage),
        ExpiryConfig::with_base_interval(config.sweep_interval),
    );

    let stats = Arc::new(ConnectionStats::new());

    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    info!(address = %config.bind_address(), "Listening");

    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping server..."),
            Err(e) => {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&storage), Arc::clone(&stats)) => {}
        _ = shutdown => {}
    }

    sweeper.stop();

    let storage_stats = storage.stats();
    info!(
        keys = storage_stats.keys,
        gets = storage_stats.get_ops,
        sets = storage_stats.set_ops,
        deletes = storage_stats.del_ops,
        expired = storage_stats.expired,
        connections = stats.connections_accepted.load(Ordering::Relaxed),
        rejected = stats.connections_rejected.load(Ordering::Relaxed),
        commands = stats.commands_processed.load(Ordering::Relaxed),
        "Server shutdown complete"
    );
    Ok(())
}

/// Accepts connections forever, one task per client.
async fn accept_loop(
    listener: TcpListener,
    storage: Arc<StorageEngine>,
    stats: Arc<ConnectionStats>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let handler = CommandHandler::new(Arc::clone(&storage));
                let stats = Arc::clone(&stats);

                tokio::spawn(handle_connection(stream, addr, handler, stats));
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}
