use crate::error::IngestError;
use chrono::{DateTime, Utc};
use std::fmt;

/// A (network, station, channel) subscription target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSelector {
    pub network: String,
    pub station: String,
    pub channel: String,
}

impl StreamSelector {
    pub fn new(network: &str, station: &str, channel: &str) -> Self {
        Self {
            network: network.to_string(),
            station: station.to_string(),
            channel: channel.to_string(),
        }
    }

    /// Accepts exactly three non-blank parts.
    pub fn from_parts(parts: &[String]) -> Result<Self, IngestError> {
        match parts {
            [network, station, channel]
                if [network, station, channel]
                    .iter()
                    .all(|part| !part.trim().is_empty()) =>
            {
                Ok(Self::new(network.trim(), station.trim(), channel.trim()))
            }
            _ => Err(IngestError::MalformedSelector {
                parts: parts.to_vec(),
            }),
        }
    }
}

impl fmt::Display for StreamSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.*.{}", self.network, self.station, self.channel)
    }
}

/// One persisted amplitude with its derived absolute timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleRecord {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub station_id: String,
    pub sample_index: usize,
    pub amplitude: f64,
    pub sampling_rate_hz: f64,
    pub packet_start_time: DateTime<Utc>,
    pub packet_end_time: DateTime<Utc>,
    pub packet_sample_count: usize,
    pub delta_seconds: f64,
    pub sample_timestamp: DateTime<Utc>,
}
