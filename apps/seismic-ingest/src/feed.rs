mod miniseed;
mod seedlink;

pub use seedlink::SeedLinkConnector;

use crate::error::FeedError;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

pub const DEFAULT_LOCATION: &str = "00";

/// `start + seconds`, rounded to the nanosecond. `None` when the offset is
/// not finite or does not fit a timestamp.
pub fn offset_by_seconds(start: DateTime<Utc>, seconds: f64) -> Option<DateTime<Utc>> {
    let nanos = (seconds * 1e9).round();
    if !nanos.is_finite() || nanos.abs() >= i64::MAX as f64 {
        return None;
    }
    start.checked_add_signed(ChronoDuration::nanoseconds(nanos as i64))
}

/// One burst of contiguous samples for a single channel, as delivered by the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformPacket {
    pub station_id: String,
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub sampling_rate_hz: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub sample_count: usize,
    pub delta_seconds: f64,
    pub samples: Vec<f64>,
}

impl WaveformPacket {
    /// Builds a packet from raw feed metadata. The station id keeps the raw
    /// location code while `location` falls back to `"00"` when blank.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network: &str,
        station: &str,
        location: &str,
        channel: &str,
        sampling_rate_hz: f64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        samples: Vec<f64>,
    ) -> Self {
        let network = network.trim();
        let station = station.trim();
        let raw_location = location.trim();
        let channel = channel.trim();
        let delta_seconds = if sampling_rate_hz > 0.0 {
            1.0 / sampling_rate_hz
        } else {
            0.0
        };
        let location = if raw_location.is_empty() {
            DEFAULT_LOCATION.to_string()
        } else {
            raw_location.to_string()
        };

        Self {
            station_id: format!("{network}.{station}.{raw_location}.{channel}"),
            network: network.to_string(),
            station: station.to_string(),
            location,
            channel: channel.to_string(),
            sampling_rate_hz,
            start_time,
            end_time,
            sample_count: samples.len(),
            delta_seconds,
            samples,
        }
    }

    pub fn has_valid_rate(&self) -> bool {
        self.sampling_rate_hz.is_finite() && self.sampling_rate_hz > 0.0
    }
}

#[derive(Debug)]
pub enum FeedEvent {
    Packet(WaveformPacket),
    /// The remote end closed the stream at a packet boundary.
    Closed,
}

/// Opens connections to a feed server.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self, server: &str) -> Result<Box<dyn FeedConnection>, FeedError>;
}

/// One live feed connection. `receive` blocks until a packet, a clean close,
/// or a transport failure.
#[async_trait]
pub trait FeedConnection: Send {
    async fn subscribe(
        &mut self,
        network: &str,
        station: &str,
        channel: &str,
    ) -> Result<(), FeedError>;

    async fn receive(&mut self) -> Result<FeedEvent, FeedError>;
}
