//! RLHF Daemon - feedback-driven policy training service
//!
//! The daemon accepts officer feedback on predictions over HTTP, turns it
//! into rewards, and periodically fine-tunes the policy from a replay buffer.

// Pedantic clippy allows - intentional design decisions for this crate:
// - doc_markdown: RLHF and PPO acronyms don't need backticks
// - cast_precision_loss: Duration and counter conversions are safe within expected ranges
// - cast_possible_wrap: usize to i64 gauge conversions are bounded by buffer capacity
// - unused_async: Async handlers maintain consistency in axum
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::unused_async)]

use std::sync::Arc;

use anyhow::Result;
use rlhf_core::util::load_env_file;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod daemon;
mod metrics;
mod validation;

use crate::config::Config;
use crate::daemon::RlhfDaemon;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from rlhf.env file first
    load_env_file();

    // Load configuration to get log settings
    let config = Config::load()?;

    let level = &config.daemon.log_level;
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rlhfd={level},rlhf_train={level},tower_http=debug").into());

    let file_logging_enabled = if !config.daemon.log_file.is_empty() {
        let log_path = std::path::Path::new(&config.daemon.log_file);
        let log_dir = log_path.parent().unwrap_or(std::path::Path::new("."));
        let log_filename = log_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("rlhfd.log");

        let can_write = (|| -> std::io::Result<()> {
            if !log_dir.exists() {
                std::fs::create_dir_all(log_dir)?;
            }
            let test_path = log_dir.join(".write_test");
            std::fs::write(&test_path, "test")?;
            std::fs::remove_file(&test_path)?;
            Ok(())
        })();

        match can_write {
            Ok(()) => {
                let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
                    .init();

                // Guard must outlive every log call
                Box::leak(Box::new(guard));
                true
            }
            Err(e) => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer())
                    .init();
                eprintln!(
                    "Warning: Could not set up file logging to '{}': {}. Using stdout only.",
                    config.daemon.log_file, e
                );
                false
            }
        }
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        false
    };

    info!("Starting RLHF Daemon v{}", env!("CARGO_PKG_VERSION"));
    if file_logging_enabled {
        info!("Logging to file: {}", config.daemon.log_file);
    } else if !config.daemon.log_file.is_empty() {
        warn!("File logging was configured but could not be enabled");
    }
    info!("Data directory: {:?}", config.daemon.get_data_dir());
    info!(
        bind_address = %config.daemon.bind_address,
        update_strategy = %config.training.update_strategy,
        buffer_type = ?config.buffer.buffer_type,
        update_frequency = ?config.training.update_frequency,
        "Configuration loaded"
    );
    if !config.checkpoint.enabled {
        warn!("Checkpointing is disabled; policy updates are lost on restart");
    }

    let daemon = Arc::new(RlhfDaemon::new(config).await?);
    let daemon_handle = daemon.clone();

    let daemon_task = tokio::spawn(async move {
        if let Err(e) = daemon.run().await {
            error!("Daemon error: {}", e);
        }
    });

    // Wait for shutdown signal (SIGINT or SIGTERM)
    shutdown_signal().await;

    info!("Initiating graceful shutdown...");
    daemon_handle.shutdown().await?;

    let _ = daemon_task.await;

    info!("RLHF Daemon stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}. Using fallback.", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}. Using Ctrl+C only.", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        () = terminate => {
            info!("Received SIGTERM");
        }
    }
}
