//! DriveMirror Daemon - Background synchronization service
//!
//! Runs as a long-lived process (typically a systemd user service) and
//! handles:
//! - Bidirectional sync between a local directory and a Drive folder
//! - Filesystem watching for near-real-time pushes
//! - Periodic remote polling
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! The daemon wires the watcher into a coalescing change queue, builds the
//! sync engine on top of the Drive adapter, and runs the engine's loop. A
//! `CancellationToken` triggered on SIGTERM or SIGINT stops everything.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use drivemirror_core::config::Config;
use drivemirror_core::domain::newtypes::RemoteId;
use drivemirror_core::ports::change_source::IChangeSource;
use drivemirror_drive::{DriveClient, DriveRemoteStore};
use drivemirror_sync::{ChangeQueue, ChangeRouter, DirWatcher, SyncEngine, SyncStateStore};

// ============================================================================
// DaemonService
// ============================================================================

/// Orchestrates the watcher, queue, and engine for one sync root
struct DaemonService {
    config: Config,
    shutdown: CancellationToken,
}

impl DaemonService {
    /// Loads and validates configuration
    ///
    /// Invalid configuration is fatal at startup; every error is reported
    /// before the process exits.
    fn new(shutdown: CancellationToken) -> Result<Self> {
        let config_path = Config::default_path();
        let config = Config::load_or_default(&config_path);
        info!(config_path = %config_path.display(), "loaded configuration");

        let errors = config.validate();
        if !errors.is_empty() {
            for e in &errors {
                error!(field = %e.field, "invalid configuration: {}", e.message);
            }
            anyhow::bail!("configuration has {} error(s)", errors.len());
        }

        Ok(Self { config, shutdown })
    }

    /// Builds the component graph and runs the sync loop until shutdown
    async fn run(&self) -> Result<()> {
        let token = std::env::var(&self.config.auth.token_env).with_context(|| {
            format!(
                "no access token in ${}; export one before starting the daemon",
                self.config.auth.token_env
            )
        })?;

        tokio::fs::create_dir_all(&self.config.sync.root)
            .await
            .with_context(|| {
                format!(
                    "failed to create sync root: {}",
                    self.config.sync.root.display()
                )
            })?;

        let folder = self
            .config
            .remote
            .folder_id
            .as_deref()
            .map(RemoteId::new)
            .transpose()
            .context("invalid remote folder id")?;

        let client = DriveClient::new(token)
            .with_chunk_size((self.config.remote.chunk_size_kb * 1024) as usize);
        let remote = Arc::new(DriveRemoteStore::new(client));

        let state = SyncStateStore::open(&self.config.sync.state_file);
        info!(
            state_file = %self.config.sync.state_file.display(),
            tracked = state.len(),
            "opened state document"
        );

        let queue = Arc::new(ChangeQueue::new());
        let router = Arc::new(ChangeRouter::new(
            self.config.sync.root.clone(),
            &self.config.sync.state_file,
            queue.clone(),
        ));

        let mut watcher = DirWatcher::new(
            self.config.sync.root.clone(),
            &self.config.sync.state_file,
            router,
        );
        watcher.start().context("failed to start file watcher")?;

        // the engine owns the watcher from here on and stops it before its
        // final queue drain on shutdown
        let mut engine = SyncEngine::new(
            remote,
            state,
            queue,
            self.config.sync.root.clone(),
            folder,
            Duration::from_secs(self.config.sync.poll_interval),
            self.shutdown.clone(),
        )
        .with_change_source(Box::new(watcher));

        engine.run().await
    }
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    info!("DriveMirror daemon starting (drivemirrord)");

    let shutdown_token = CancellationToken::new();

    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(shutdown_token.clone())?;
    let result = service.run().await;

    match &result {
        Ok(()) => info!("DriveMirror daemon shut down gracefully"),
        Err(e) => error!(error = %e, "DriveMirror daemon exiting with error"),
    }

    result
}

// ============================================================================
// Tests
// ============================================================================
