use super::expand::expand;
use super::sink::PersistenceSink;
use super::types::StreamSelector;
use crate::config::SelectorParts;
use crate::error::{FeedError, IngestError};
use crate::feed::{FeedConnection, FeedConnector, FeedEvent, WaveformPacket};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How a session that did not fail came to an end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server closed the stream without error.
    Closed,
    /// Shutdown was requested.
    Cancelled,
}

/// One connection's lifetime: connect, subscribe, then receive and persist
/// packets until the stream ends.
#[derive(Clone)]
pub struct StreamSession {
    connector: Arc<dyn FeedConnector>,
    server: String,
    sink: PersistenceSink,
}

impl StreamSession {
    pub fn new(connector: Arc<dyn FeedConnector>, server: impl Into<String>, sink: PersistenceSink) -> Self {
        Self {
            connector,
            server: server.into(),
            sink,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Runs a single session. `on_streaming` fires once every selector has
    /// been processed and packets are about to flow. A session in which no
    /// selector was accepted fails instead of streaming.
    pub async fn run<F>(
        &self,
        selectors: &[SelectorParts],
        cancel: &CancellationToken,
        on_streaming: F,
    ) -> Result<SessionEnd, IngestError>
    where
        F: FnOnce() + Send,
    {
        let mut connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            connected = self.connector.connect(&self.server) => connected?,
        };

        let subscribed = subscribe_all(connection.as_mut(), selectors).await?;
        // Without a STATION command the server would fall back to uni-station mode.
        if subscribed == 0 {
            return Err(IngestError::NoStreams {
                server: self.server.clone(),
            });
        }

        tracing::info!(server = %self.server, subscribed, "starting raw seismic data collection");
        on_streaming();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                event = connection.receive() => event?,
            };

            match event {
                FeedEvent::Packet(packet) => self.process_packet(packet).await,
                FeedEvent::Closed => {
                    tracing::info!(server = %self.server, "seismic stream closed by server");
                    return Ok(SessionEnd::Closed);
                }
            }
        }
    }

    async fn process_packet(&self, packet: WaveformPacket) {
        self.sink.stats().add_packet();
        tracing::info!(
            station_id = %packet.station_id,
            samples = packet.samples.len(),
            rate_hz = packet.sampling_rate_hz,
            "processing {} | {} samples | rate {} Hz",
            packet.station_id,
            packet.samples.len(),
            packet.sampling_rate_hz
        );

        if !packet.has_valid_rate() {
            tracing::warn!(
                station_id = %packet.station_id,
                rate_hz = packet.sampling_rate_hz,
                "dropping packet with unusable sampling rate"
            );
            return;
        }
        if packet.sample_count != packet.samples.len() {
            tracing::warn!(
                station_id = %packet.station_id,
                declared = packet.sample_count,
                decoded = packet.samples.len(),
                "packet sample count does not match decoded samples"
            );
        }

        let records = expand(&packet);
        let summary = self.sink.write_packet(records).await;
        if summary.failed > 0 {
            tracing::warn!(
                station_id = %packet.station_id,
                written = summary.written,
                failed = summary.failed,
                "packet persisted with failures"
            );
        }
    }
}

/// Applies each selector in order. Malformed or rejected selectors are
/// skipped; transport failures end the session.
async fn subscribe_all(
    connection: &mut dyn FeedConnection,
    selectors: &[SelectorParts],
) -> Result<usize, IngestError> {
    let mut subscribed = 0;
    for parts in selectors {
        let selector = match StreamSelector::from_parts(parts) {
            Ok(selector) => selector,
            Err(err) => {
                tracing::warn!(error = %err, "invalid stream configuration; skipping");
                continue;
            }
        };

        match connection
            .subscribe(&selector.network, &selector.station, &selector.channel)
            .await
        {
            Ok(()) => {
                tracing::info!(stream = %selector, "selected stream");
                subscribed += 1;
            }
            Err(FeedError::Rejected(command)) => {
                tracing::warn!(stream = %selector, %command, "server rejected stream selection; skipping");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(subscribed)
}
