use super::session::{SessionEnd, StreamSession};
use crate::config::SelectorParts;
use crate::pipeline::IngestStats;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Connecting,
    Streaming,
    Closed,
    Failed,
    Stopped,
}

/// Whether a session that reached streaming refunds the failure budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryBudget {
    /// Failures count against one budget for the controller's lifetime.
    Lifetime,
    /// The failure count resets whenever a session starts streaming.
    ResetOnStreaming,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Total session attempts allowed before giving up.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub budget: RetryBudget,
}

impl ReconnectPolicy {
    /// Wait after the `failures`-th consecutive failure (1-based):
    /// `base_delay * 2^(failures - 1)`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Closed,
    RetriesExhausted,
    Cancelled,
}

/// What a controller did over its lifetime.
#[derive(Clone, Debug)]
pub struct ControllerReport {
    pub server: String,
    pub final_state: ControllerState,
    pub reason: StopReason,
    pub attempts: u32,
    pub waits: Vec<Duration>,
    pub sessions_streamed: u32,
}

/// Keeps one feed endpoint alive: reruns the session after transport
/// failures with exponential backoff until it closes cleanly, the retry
/// budget runs out, or shutdown is requested.
pub struct ReconnectController {
    session: StreamSession,
    selectors: Vec<SelectorParts>,
    policy: ReconnectPolicy,
    stats: Arc<IngestStats>,
    state: watch::Sender<ControllerState>,
}

impl ReconnectController {
    pub fn new(
        session: StreamSession,
        selectors: Vec<SelectorParts>,
        policy: ReconnectPolicy,
        stats: Arc<IngestStats>,
    ) -> Self {
        let (state, _) = watch::channel(ControllerState::Idle);
        Self {
            session,
            selectors,
            policy,
            stats,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ControllerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(server = %self.session.server(), ?previous, ?next, "controller state change");
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> ControllerReport {
        let server = self.session.server().to_string();
        let mut attempts = 0u32;
        let mut failures = 0u32;
        let mut sessions_streamed = 0u32;
        let mut waits = Vec::new();

        let reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }

            self.transition(ControllerState::Connecting);
            attempts += 1;
            self.stats.add_connect_attempt();
            tracing::info!(
                %server,
                attempt = failures + 1,
                max_retries = self.policy.max_retries,
                "connecting to seismic feed"
            );

            let mut streamed = false;
            let result = {
                let state = &self.state;
                let stats = &self.stats;
                let streamed = &mut streamed;
                self.session
                    .run(&self.selectors, &cancel, move || {
                        *streamed = true;
                        stats.set_streaming(true);
                        state.send_replace(ControllerState::Streaming);
                    })
                    .await
            };
            if streamed {
                sessions_streamed += 1;
                self.stats.set_streaming(false);
            }

            match result {
                Ok(SessionEnd::Closed) => {
                    self.transition(ControllerState::Closed);
                    tracing::info!(%server, "seismic stream ended normally");
                    break StopReason::Closed;
                }
                Ok(SessionEnd::Cancelled) => break StopReason::Cancelled,
                Err(err) => {
                    self.transition(ControllerState::Failed);
                    self.stats.record_error(err.to_string());
                    if streamed && self.policy.budget == RetryBudget::ResetOnStreaming {
                        failures = 0;
                    }
                    failures += 1;
                    tracing::error!(%server, error = %err, failures, "seismic stream connection failed");

                    if failures >= self.policy.max_retries {
                        tracing::error!(%server, attempts, "max retries reached; giving up on feed");
                        break StopReason::RetriesExhausted;
                    }

                    let delay = self.policy.backoff(failures);
                    tracing::info!(%server, delay_secs = delay.as_secs_f64(), "retrying in {:?}", delay);
                    waits.push(delay);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break StopReason::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        if reason != StopReason::Closed {
            self.transition(ControllerState::Stopped);
        }

        ControllerReport {
            server,
            final_state: *self.state.borrow(),
            reason,
            attempts,
            waits,
            sessions_streamed,
        }
    }
}
