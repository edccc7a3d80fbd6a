//! Hwcomp service
//!
//! Loads the display configuration, starts the scheduler with its vsync and
//! hotplug threads, and serves scene producers over a unix socket.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hwcomp::server::{self, IpcServer, Scheduler};
use hwcomp::{Config, Hwc};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "hwcomp=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting hwcomp plane scheduler");

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let config_path = args
        .iter()
        .position(|arg| arg == "--config" || arg == "-c")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    let config = match &config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let ipc = IpcServer::new();
    let event_tx = ipc.event_sender();
    let hwc = Hwc::new(&config, server::callbacks(event_tx.clone()))
        .context("Failed to start scheduler")?;
    let mut scheduler = Scheduler::new(hwc, config.sync.policy().lock_timeout, event_tx);
    let mut handle = ipc.start().await.context("Failed to start IPC server")?;

    // Setup signal handlers for graceful shutdown
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    // Handle SIGTERM and SIGINT
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    let _ = tx.send(()).await;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    let _ = tx.send(()).await;
                }
            }
        });
    }

    loop {
        tokio::select! {
            message = handle.recv() => {
                let Some(message) = message else {
                    error!("IPC server stopped");
                    break;
                };
                // Frames block on buffer locks for bounded time only
                tokio::task::block_in_place(|| scheduler.handle(message));
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, cleaning up...");
                break;
            }
        }
    }

    info!("{}", scheduler.hwc().dump());
    drop(scheduler);
    let _ = std::fs::remove_file(hwcomp_ipc::socket_path());
    Ok(())
}
