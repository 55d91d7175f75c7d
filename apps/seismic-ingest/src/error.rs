use thiserror::Error;

/// Failures reported by a feed client implementation.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("feed protocol error: {0}")]
    Protocol(String),
    /// The server refused one subscription; the connection itself is still usable.
    #[error("subscription rejected: {0}")]
    Rejected(String),
}

/// Failures reported by a sample store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("store rejected write: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("transport error: {0}")]
    Transport(#[from] FeedError),
    #[error("malformed stream selector {parts:?}: expected network, station, channel")]
    MalformedSelector { parts: Vec<String> },
    #[error("no streams accepted by {server}")]
    NoStreams { server: String },
    #[error("failed to persist sample {sample_index} of {station_id}: {source}")]
    Persistence {
        station_id: String,
        sample_index: usize,
        #[source]
        source: StoreError,
    },
    #[error("table setup failed: {0}")]
    Setup(#[source] StoreError),
}
