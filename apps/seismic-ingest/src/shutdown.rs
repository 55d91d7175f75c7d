use crate::ingest::ControllerReport;
use crate::pipeline::IngestStats;
use crate::store::SampleStore;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Termination signal handlers, installed before any resource that needs an
/// orderly shutdown is created.
pub struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    #[cfg(unix)]
    pub fn register() -> Result<Self> {
        use anyhow::Context;
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?,
            terminate: signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?,
        })
    }

    #[cfg(not(unix))]
    pub fn register() -> Result<Self> {
        Ok(Self {})
    }

    /// Resolves with the name of the first termination signal received.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> &'static str {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "ctrl-c handler unavailable; waiting for workers instead");
            std::future::pending::<()>().await;
        }
        "SIGINT"
    }
}

/// Owns the process-wide cancel token and the store handle. On a signal it
/// stops every worker without waiting for in-flight writes, then closes the
/// pool once.
pub struct ShutdownCoordinator {
    cancel: CancellationToken,
    store: Arc<dyn SampleStore>,
    stats: Arc<IngestStats>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(store: Arc<dyn SampleStore>, stats: Arc<IngestStats>, grace: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            store,
            stats,
            grace,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn on_signal(self, signal: &str, workers: &mut JoinSet<ControllerReport>) {
        tracing::info!(signal, "received shutdown signal; stopping stream processing");
        self.cancel.cancel();
        workers.abort_all();
        self.close_store().await;
    }

    /// Closes the pool after every worker has already finished on its own.
    pub async fn on_workers_finished(self) {
        tracing::info!("all feed workers stopped");
        self.cancel.cancel();
        self.close_store().await;
    }

    async fn close_store(self) {
        self.stats.log_summary();
        match tokio::time::timeout(self.grace, self.store.close()).await {
            Ok(()) => tracing::info!("connection pool closed"),
            Err(_) => tracing::warn!(
                grace_ms = self.grace.as_millis() as u64,
                "connection pool did not close within grace period; exiting anyway"
            ),
        }
    }
}
