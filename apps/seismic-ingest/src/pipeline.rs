use crate::config::FeedEndpoint;
use crate::feed::FeedConnector;
use crate::ingest::{ControllerReport, PersistenceSink, ReconnectController, ReconnectPolicy, StreamSession};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct IngestStats {
    pub packets_received: AtomicU64,
    pub samples_written: AtomicU64,
    pub samples_failed: AtomicU64,
    pub connect_attempts: AtomicU64,
    pub streaming_sessions: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            packets_received: AtomicU64::new(0),
            samples_written: AtomicU64::new(0),
            samples_failed: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            streaming_sessions: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn add_packet(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_written(&self, count: u64) {
        self.samples_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_failed(&self, count: u64) {
        self.samples_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_streaming(&self, streaming: bool) {
        if streaming {
            self.streaming_sessions.fetch_add(1, Ordering::Relaxed);
        } else {
            let _ = self
                .streaming_sessions
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
    }

    pub fn samples_failed(&self) -> u64 {
        self.samples_failed.load(Ordering::Relaxed)
    }

    /// Written plus failed: every sample the sink has attempted.
    pub fn samples_processed(&self) -> u64 {
        self.samples_written.load(Ordering::Relaxed) + self.samples_failed()
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn log_summary(&self) {
        tracing::info!(
            packets = self.packets_received.load(Ordering::Relaxed),
            written = self.samples_written.load(Ordering::Relaxed),
            failed = self.samples_failed(),
            connect_attempts = self.connect_attempts.load(Ordering::Relaxed),
            last_error = self.last_error().as_deref().unwrap_or("none"),
            "ingest totals"
        );
    }
}

/// Spawns one reconnect controller per feed endpoint. The workers share the
/// sink and therefore the store's pool.
pub fn spawn_workers(
    feeds: &[FeedEndpoint],
    connector: Arc<dyn FeedConnector>,
    sink: PersistenceSink,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
) -> JoinSet<ControllerReport> {
    let mut workers = JoinSet::new();
    for feed in feeds {
        let session = StreamSession::new(connector.clone(), feed.server.clone(), sink.clone());
        let controller =
            ReconnectController::new(session, feed.streams.clone(), policy.clone(), sink.stats());
        let cancel = cancel.clone();
        tracing::info!(server = %feed.server, streams = feed.streams.len(), "starting feed worker");
        workers.spawn(controller.run(cancel));
    }
    workers
}

/// Waits for every worker to finish and logs how each one ended.
pub async fn drain_workers(workers: &mut JoinSet<ControllerReport>) {
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(report) => tracing::info!(
                server = %report.server,
                reason = ?report.reason,
                state = ?report.final_state,
                attempts = report.attempts,
                "feed worker finished"
            ),
            Err(err) if err.is_cancelled() => {}
            Err(err) => tracing::error!(error = %err, "feed worker panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processed_counts_failures_too() {
        let stats = IngestStats::new();
        stats.add_written(3);
        stats.add_failed(2);
        assert_eq!(stats.samples_processed(), 5);
        stats.record_error("boom");
        assert_eq!(stats.last_error().as_deref(), Some("boom"));
    }

    #[test]
    fn streaming_gauge_never_underflows() {
        let stats = IngestStats::new();
        stats.set_streaming(false);
        stats.set_streaming(true);
        stats.set_streaming(false);
        stats.set_streaming(false);
        assert_eq!(stats.streaming_sessions.load(Ordering::Relaxed), 0);
    }
}
