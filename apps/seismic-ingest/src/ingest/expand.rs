use super::types::SampleRecord;
use crate::feed::{offset_by_seconds, WaveformPacket};
use chrono::{DateTime, Utc};

/// Turns one packet into one record per sample, in sample order.
///
/// Each timestamp is derived directly from its index so rounding error does
/// not accumulate across the packet. Packets with no samples, or without a
/// usable sampling rate, expand to nothing. A sample whose timestamp falls
/// outside the representable range is logged and left out.
pub fn expand(packet: &WaveformPacket) -> Vec<SampleRecord> {
    if !packet.has_valid_rate() {
        return Vec::new();
    }

    packet
        .samples
        .iter()
        .enumerate()
        .filter_map(|(index, amplitude)| {
            let Some(sample_timestamp) =
                sample_timestamp(packet.start_time, index, packet.sampling_rate_hz)
            else {
                tracing::warn!(
                    station_id = %packet.station_id,
                    sample_index = index,
                    rate_hz = packet.sampling_rate_hz,
                    "sample timestamp out of range; skipping sample"
                );
                return None;
            };
            Some(SampleRecord {
                network: packet.network.clone(),
                station: packet.station.clone(),
                location: packet.location.clone(),
                channel: packet.channel.clone(),
                station_id: packet.station_id.clone(),
                sample_index: index,
                amplitude: *amplitude,
                sampling_rate_hz: packet.sampling_rate_hz,
                packet_start_time: packet.start_time,
                packet_end_time: packet.end_time,
                packet_sample_count: packet.sample_count,
                delta_seconds: packet.delta_seconds,
                sample_timestamp,
            })
        })
        .collect()
}

fn sample_timestamp(start: DateTime<Utc>, index: usize, sampling_rate_hz: f64) -> Option<DateTime<Utc>> {
    offset_by_seconds(start, index as f64 / sampling_rate_hz)
}
