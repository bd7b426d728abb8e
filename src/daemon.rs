//! Foreground service running scheduled pipelines
//!
//! The daemon owns the [`ScheduleService`], starts its timer engine and waits
//! for SIGTERM or SIGINT. On shutdown every schedule is stopped, which removes
//! its trigger and disposes its pipeline tree.
//!
//! # Example
//!
//! ```no_run
//! use databridge::commands::{FileLooper, Group};
//! use databridge::daemon::Daemon;
//! use databridge::schedule::ScheduleInfo;
//! use databridge::settings::Settings;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let daemon = Daemon::new(&Settings::default()).await?;
//!
//! let root = Group::new("inbox").with_child(FileLooper::new("scan").with_directory("/in"));
//! daemon
//!     .add_pipeline("inbox", ScheduleInfo::every_minutes(15), Box::new(root))
//!     .await?;
//!
//! // blocks until a shutdown signal arrives
//! daemon.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::command::Command;
use crate::error::{BridgeError, Result};
use crate::metrics::MetricsServer;
use crate::schedule::ScheduleInfo;
use crate::scheduler::{ScheduleId, ScheduleService};
use crate::settings::Settings;
use crate::timer::CronTimerEngine;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, error, info};

pub struct Daemon {
    service: Arc<ScheduleService>,
    metrics: MetricsServer,
    metrics_port: Option<u16>,
    pid_file: Option<PathBuf>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Daemon {
    /// Create a daemon from settings
    ///
    /// # Errors
    ///
    /// * `BridgeError::Other` - If a PID file from another instance exists
    pub async fn new(settings: &Settings) -> Result<Self> {
        info!("Initializing DataBridge daemon");

        if let Some(pid_file) = &settings.pid_file {
            if pid_file.exists() {
                let existing_pid = fs::read_to_string(pid_file)
                    .unwrap_or_else(|_| "unknown".to_string())
                    .trim()
                    .to_string();

                return Err(BridgeError::Other(format!(
                    "Daemon already running with PID {} (or stale PID file exists at {:?})",
                    existing_pid, pid_file
                )));
            }
        }

        let engine = CronTimerEngine::new().await?;
        let metrics = MetricsServer::new();
        let service = ScheduleService::new(Arc::new(engine)).with_metrics(metrics.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            service: Arc::new(service),
            metrics,
            metrics_port: settings.metrics_port,
            pid_file: settings.pid_file.clone(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn service(&self) -> &Arc<ScheduleService> {
        &self.service
    }

    pub fn metrics(&self) -> &MetricsServer {
        &self.metrics
    }

    /// Register and arm a pipeline
    pub async fn add_pipeline(
        &self,
        name: &str,
        schedule: ScheduleInfo,
        root: Box<dyn Command>,
    ) -> Result<ScheduleId> {
        self.service.schedule(name, schedule, root).await
    }

    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file {
            let pid = std::process::id();
            info!("Writing PID file: {:?} (PID: {})", pid_file, pid);
            fs::write(pid_file, pid.to_string())?;
        }
        Ok(())
    }

    fn remove_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file {
            if pid_file.exists() {
                info!("Removing PID file: {:?}", pid_file);
                fs::remove_file(pid_file)?;
            }
        }
        Ok(())
    }

    /// Run until SIGTERM, SIGINT or [`Daemon::request_shutdown`]
    pub async fn run(&self) -> Result<()> {
        info!("Starting DataBridge daemon");

        self.write_pid_file()?;
        let _guard = self.pid_file.clone().map(|pid_file| PidFileGuard { pid_file });

        if let Some(port) = self.metrics_port {
            self.metrics
                .start(port)
                .await
                .map_err(|e| BridgeError::Other(format!("Failed to start metrics server: {}", e)))?;
        }

        self.service.start().await?;
        info!(schedules = self.service.len(), "Daemon started, waiting for signals");

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| BridgeError::Other(format!("Failed to setup SIGTERM handler: {}", e)))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| BridgeError::Other(format!("Failed to setup SIGINT handler: {}", e)))?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        if !*shutdown_rx.borrow() {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = shutdown_rx.changed() => {
                    info!("Shutdown requested");
                }
            }
        }

        self.shutdown().await
    }

    /// Ask a running daemon to stop
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Stop every schedule, shut the timer engine down and remove the PID file
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down daemon...");
        let _ = self.shutdown_tx.send(true);

        let stopped = self.service.shutdown().await;
        self.remove_pid_file()?;

        info!("Daemon shutdown complete");
        stopped
    }
}

/// Removes the PID file on every exit path
struct PidFileGuard {
    pid_file: PathBuf,
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        if self.pid_file.exists() {
            debug!("Cleaning up PID file: {:?}", self.pid_file);
            if let Err(e) = fs::remove_file(&self.pid_file) {
                error!("Failed to remove PID file in guard: {}", e);
            }
        }
    }
}
