use super::types::SampleRecord;
use crate::error::IngestError;
use crate::pipeline::IngestStats;
use crate::store::SampleStore;
use anyhow::anyhow;
use std::str::FromStr;
use std::sync::Arc;

/// How a packet's records reach the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// One insert + commit per sample.
    PerSample,
    /// One multi-row insert per packet, falling back to per-sample writes
    /// when the batch fails.
    PerPacket,
}

impl FromStr for WriteMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "per_sample" | "sample" => Ok(WriteMode::PerSample),
            "per_packet" | "packet" => Ok(WriteMode::PerPacket),
            other => Err(anyhow!(
                "unknown write mode {other:?}; expected per_sample or per_packet"
            )),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacketWriteSummary {
    pub written: usize,
    pub failed: usize,
}

/// Writes sample records to the store. Failures are logged with the record
/// context and returned; nothing is retried and the caller moves on.
#[derive(Clone)]
pub struct PersistenceSink {
    store: Arc<dyn SampleStore>,
    stats: Arc<IngestStats>,
    mode: WriteMode,
    progress_every: u64,
}

impl PersistenceSink {
    pub fn new(
        store: Arc<dyn SampleStore>,
        stats: Arc<IngestStats>,
        mode: WriteMode,
        progress_every: u64,
    ) -> Self {
        Self {
            store,
            stats,
            mode,
            progress_every: progress_every.max(1),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// One-time table preparation. Must complete before any worker starts.
    pub async fn setup(&self, recreate: bool) -> Result<(), IngestError> {
        match self.store.create_table(recreate).await {
            Ok(()) => {
                tracing::info!(recreate, "seismic events table ready");
                Ok(())
            }
            Err(err) => {
                self.stats.record_error(err.to_string());
                tracing::error!(error = %err, "error creating seismic events table");
                Err(IngestError::Setup(err))
            }
        }
    }

    pub async fn put(&self, record: SampleRecord) -> Result<(), IngestError> {
        let result = self.store.insert_sample(&record).await;
        match result {
            Ok(()) => {
                self.stats.add_written(1);
                self.log_progress(1);
                Ok(())
            }
            Err(source) => {
                self.stats.add_failed(1);
                self.stats.record_error(source.to_string());
                tracing::error!(
                    station_id = %record.station_id,
                    sample_index = record.sample_index,
                    timestamp = %record.sample_timestamp,
                    error = %source,
                    "error inserting seismic sample"
                );
                self.log_progress(1);
                Err(IngestError::Persistence {
                    station_id: record.station_id,
                    sample_index: record.sample_index,
                    source,
                })
            }
        }
    }

    /// Persists one packet's records in index order. A failed record never
    /// stops the remaining records from being attempted.
    pub async fn write_packet(&self, records: Vec<SampleRecord>) -> PacketWriteSummary {
        if records.is_empty() {
            return PacketWriteSummary::default();
        }

        if self.mode == WriteMode::PerPacket {
            match self.store.insert_packet(&records).await {
                Ok(()) => {
                    let len = records.len();
                    self.stats.add_written(len as u64);
                    self.log_progress(len as u64);
                    return PacketWriteSummary {
                        written: len,
                        failed: 0,
                    };
                }
                Err(err) => {
                    tracing::warn!(
                        station_id = %records[0].station_id,
                        samples = records.len(),
                        error = %err,
                        "packet insert failed; falling back to per-sample writes"
                    );
                }
            }
        }

        let mut summary = PacketWriteSummary::default();
        for record in records {
            match self.put(record).await {
                Ok(()) => summary.written += 1,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }

    fn log_progress(&self, added: u64) {
        let total = self.stats.samples_processed();
        let before = total.saturating_sub(added);
        if total / self.progress_every > before / self.progress_every {
            tracing::info!(
                samples = total,
                failed = self.stats.samples_failed(),
                "collected {total} raw seismic samples"
            );
        }
    }
}
