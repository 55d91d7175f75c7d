use super::{
    ControllerState, PersistenceSink, ReconnectController, ReconnectPolicy, RetryBudget, SampleRecord,
    StopReason, StreamSession, WriteMode,
};
use crate::config::{SelectorParts, StoreConfig};
use crate::error::{FeedError, IngestError, StoreError};
use crate::feed::{FeedConnection, FeedConnector, FeedEvent, WaveformPacket};
use crate::pipeline::IngestStats;
use crate::shutdown::ShutdownCoordinator;
use crate::store::{build_pool, QuestDbStore, SampleStore};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::VecDeque;
use std::env;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
enum Step {
    Packet(WaveformPacket),
    Close,
    Drop,
}

#[derive(Clone)]
enum Attempt {
    Refuse,
    Session(Vec<Step>),
}

type Subscriptions = Arc<Mutex<Vec<(String, String, String)>>>;

/// Plays back one scripted attempt per connect. Once the script runs out
/// every further connect is refused.
struct FakeConnector {
    script: Mutex<VecDeque<Attempt>>,
    rejected_stations: Vec<String>,
    subscriptions: Subscriptions,
    connects: AtomicUsize,
}

impl FakeConnector {
    fn new(script: Vec<Attempt>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            rejected_stations: Vec::new(),
            subscriptions: Arc::default(),
            connects: AtomicUsize::new(0),
        }
    }

    fn rejecting(mut self, station: &str) -> Self {
        self.rejected_stations.push(station.to_string());
        self
    }

    fn subscriptions(&self) -> Vec<(String, String, String)> {
        self.subscriptions.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedConnector for FakeConnector {
    async fn connect(&self, _server: &str) -> Result<Box<dyn FeedConnection>, FeedError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Attempt::Session(steps)) => Ok(Box::new(FakeConnection {
                steps: steps.into(),
                rejected_stations: self.rejected_stations.clone(),
                subscriptions: self.subscriptions.clone(),
            })),
            Some(Attempt::Refuse) | None => Err(FeedError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))),
        }
    }
}

struct FakeConnection {
    steps: VecDeque<Step>,
    rejected_stations: Vec<String>,
    subscriptions: Subscriptions,
}

#[async_trait]
impl FeedConnection for FakeConnection {
    async fn subscribe(&mut self, network: &str, station: &str, channel: &str) -> Result<(), FeedError> {
        if self.rejected_stations.iter().any(|s| s == station) {
            return Err(FeedError::Rejected(format!("STATION {station} {network}")));
        }
        self.subscriptions.lock().unwrap().push((
            network.to_string(),
            station.to_string(),
            channel.to_string(),
        ));
        Ok(())
    }

    async fn receive(&mut self) -> Result<FeedEvent, FeedError> {
        match self.steps.pop_front() {
            Some(Step::Packet(packet)) => Ok(FeedEvent::Packet(packet)),
            Some(Step::Close) => Ok(FeedEvent::Closed),
            Some(Step::Drop) => Err(FeedError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ))),
            None => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct FakeStore {
    rows: Mutex<Vec<SampleRecord>>,
    failing_indexes: Vec<usize>,
    fail_packets: bool,
    fail_setup: bool,
    hang_inserts: bool,
    hang_close: bool,
    packet_calls: AtomicUsize,
    recreated: AtomicBool,
    closed: AtomicBool,
}

impl FakeStore {
    fn rows(&self) -> Vec<SampleRecord> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl SampleStore for FakeStore {
    async fn create_table(&self, recreate: bool) -> Result<(), StoreError> {
        if self.fail_setup {
            return Err(StoreError::Rejected("store unreachable".to_string()));
        }
        self.recreated.store(recreate, Ordering::SeqCst);
        Ok(())
    }

    async fn insert_sample(&self, record: &SampleRecord) -> Result<(), StoreError> {
        if self.hang_inserts {
            std::future::pending::<()>().await;
        }
        if self.failing_indexes.contains(&record.sample_index) {
            return Err(StoreError::Rejected(format!("index {}", record.sample_index)));
        }
        self.rows.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn insert_packet(&self, records: &[SampleRecord]) -> Result<(), StoreError> {
        self.packet_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_packets {
            return Err(StoreError::Rejected("batch".to_string()));
        }
        self.rows.lock().unwrap().extend_from_slice(records);
        Ok(())
    }

    async fn close(&self) {
        if self.hang_close {
            std::future::pending::<()>().await;
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
}

fn anmo_packet() -> WaveformPacket {
    WaveformPacket::new(
        "IU",
        "ANMO",
        "00",
        "BHZ",
        20.0,
        t0(),
        t0() + ChronoDuration::milliseconds(100),
        vec![1.0, -2.0, 3.5],
    )
}

fn selectors(entries: &[&[&str]]) -> Vec<SelectorParts> {
    entries
        .iter()
        .map(|parts| parts.iter().map(|part| part.to_string()).collect())
        .collect()
}

fn policy(max_retries: u32, budget: RetryBudget) -> ReconnectPolicy {
    ReconnectPolicy {
        max_retries,
        base_delay: Duration::from_secs(5),
        budget,
    }
}

fn sink_for(store: Arc<FakeStore>, mode: WriteMode) -> PersistenceSink {
    PersistenceSink::new(store, Arc::new(IngestStats::new()), mode, 500)
}

fn controller(
    connector: Arc<FakeConnector>,
    sink: PersistenceSink,
    selectors: Vec<SelectorParts>,
    policy: ReconnectPolicy,
) -> ReconnectController {
    let stats = sink.stats();
    let session = StreamSession::new(connector, "rt.test:18000", sink);
    ReconnectController::new(session, selectors, policy, stats)
}

#[tokio::test]
async fn end_to_end_packet_becomes_three_rows() {
    let connector = Arc::new(FakeConnector::new(vec![Attempt::Session(vec![
        Step::Packet(anmo_packet()),
        Step::Close,
    ])]));
    let store = Arc::new(FakeStore::default());
    let sink = sink_for(store.clone(), WriteMode::PerSample);
    let stats = sink.stats();

    let report = controller(
        connector.clone(),
        sink,
        selectors(&[&["IU", "ANMO", "BHZ"]]),
        policy(5, RetryBudget::Lifetime),
    )
    .run(CancellationToken::new())
    .await;

    assert_eq!(report.reason, StopReason::Closed);
    assert_eq!(report.final_state, ControllerState::Closed);
    assert_eq!(report.attempts, 1);
    assert!(report.waits.is_empty());

    let rows = store.rows();
    assert_eq!(rows.len(), 3);
    let offsets_ms: Vec<i64> = rows
        .iter()
        .map(|row| (row.sample_timestamp - t0()).num_milliseconds())
        .collect();
    assert_eq!(offsets_ms, vec![0, 50, 100]);
    assert_eq!(
        rows.iter().map(|row| row.amplitude).collect::<Vec<_>>(),
        vec![1.0, -2.0, 3.5]
    );
    assert_eq!(
        rows.iter().map(|row| row.sample_index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(rows.iter().all(|row| row.station_id == "IU.ANMO.00.BHZ"));
    assert_eq!(stats.samples_processed(), 3);
    assert_eq!(stats.packets_received.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn malformed_and_rejected_selectors_are_skipped() {
    let connector = Arc::new(
        FakeConnector::new(vec![Attempt::Session(vec![Step::Packet(anmo_packet()), Step::Close])])
            .rejecting("NOPE"),
    );
    let store = Arc::new(FakeStore::default());

    let report = controller(
        connector.clone(),
        sink_for(store.clone(), WriteMode::PerSample),
        selectors(&[
            &["IU", "ANMO"],
            &["XX", "NOPE", "BHZ"],
            &["IU", "ANMO", "BHZ"],
            &["IU", "", "BHZ"],
        ]),
        policy(5, RetryBudget::Lifetime),
    )
    .run(CancellationToken::new())
    .await;

    assert_eq!(report.reason, StopReason::Closed);
    assert_eq!(
        connector.subscriptions(),
        vec![("IU".to_string(), "ANMO".to_string(), "BHZ".to_string())]
    );
    assert_eq!(store.rows().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn no_accepted_selector_fails_each_session_until_retries_run_out() {
    let idle = || Attempt::Session(Vec::new());
    let connector = Arc::new(FakeConnector::new(vec![idle(), idle(), idle(), idle(), idle()]));

    let report = controller(
        connector.clone(),
        sink_for(Arc::new(FakeStore::default()), WriteMode::PerSample),
        selectors(&[&["IU", "ANMO"], &["II"]]),
        policy(5, RetryBudget::Lifetime),
    )
    .run(CancellationToken::new())
    .await;

    assert_eq!(report.reason, StopReason::RetriesExhausted);
    assert_eq!(report.final_state, ControllerState::Stopped);
    assert_eq!(report.attempts, 5);
    assert_eq!(report.sessions_streamed, 0);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 5);
    assert!(connector.subscriptions().is_empty());
}

#[tokio::test]
async fn session_with_only_rejected_streams_never_starts_streaming() {
    let connector = Arc::new(
        FakeConnector::new(vec![Attempt::Session(vec![Step::Packet(anmo_packet())])])
            .rejecting("NOPE"),
    );
    let session = StreamSession::new(
        connector,
        "rt.test:18000",
        sink_for(Arc::new(FakeStore::default()), WriteMode::PerSample),
    );

    let mut streamed = false;
    let result = session
        .run(
            &selectors(&[&["XX", "NOPE", "BHZ"]]),
            &CancellationToken::new(),
            || streamed = true,
        )
        .await;

    assert!(matches!(result, Err(IngestError::NoStreams { .. })));
    assert!(!streamed);
}

#[tokio::test]
async fn failed_sample_does_not_block_the_rest() {
    let connector = Arc::new(FakeConnector::new(vec![Attempt::Session(vec![
        Step::Packet(anmo_packet()),
        Step::Close,
    ])]));
    let store = Arc::new(FakeStore {
        failing_indexes: vec![1],
        ..FakeStore::default()
    });
    let sink = sink_for(store.clone(), WriteMode::PerSample);
    let stats = sink.stats();

    let report = controller(
        connector,
        sink,
        selectors(&[&["IU", "ANMO", "BHZ"]]),
        policy(5, RetryBudget::Lifetime),
    )
    .run(CancellationToken::new())
    .await;

    assert_eq!(report.reason, StopReason::Closed);
    let indexes: Vec<usize> = store.rows().iter().map(|row| row.sample_index).collect();
    assert_eq!(indexes, vec![0, 2]);
    assert_eq!(stats.samples_failed(), 1);
    assert_eq!(stats.last_error().as_deref(), Some("store rejected write: index 1"));
}

#[tokio::test]
async fn put_reports_the_failing_record() {
    let store = Arc::new(FakeStore {
        failing_indexes: vec![0],
        ..FakeStore::default()
    });
    let sink = sink_for(store, WriteMode::PerSample);
    let record = super::expand(&anmo_packet()).remove(0);

    let err = sink.put(record).await.unwrap_err();
    match err {
        IngestError::Persistence {
            station_id,
            sample_index,
            ..
        } => {
            assert_eq!(station_id, "IU.ANMO.00.BHZ");
            assert_eq!(sample_index, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn packet_mode_batches_and_falls_back_per_sample() {
    let batched = Arc::new(FakeStore::default());
    let summary = sink_for(batched.clone(), WriteMode::PerPacket)
        .write_packet(super::expand(&anmo_packet()))
        .await;
    assert_eq!(summary.written, 3);
    assert_eq!(batched.packet_calls.load(Ordering::SeqCst), 1);
    assert_eq!(batched.rows().len(), 3);

    let flaky = Arc::new(FakeStore {
        fail_packets: true,
        failing_indexes: vec![2],
        ..FakeStore::default()
    });
    let summary = sink_for(flaky.clone(), WriteMode::PerPacket)
        .write_packet(super::expand(&anmo_packet()))
        .await;
    assert_eq!((summary.written, summary.failed), (2, 1));
    let indexes: Vec<usize> = flaky.rows().iter().map(|row| row.sample_index).collect();
    assert_eq!(indexes, vec![0, 1]);
}

#[tokio::test]
async fn setup_failure_is_reported_as_setup_error() {
    let store = Arc::new(FakeStore {
        fail_setup: true,
        ..FakeStore::default()
    });
    let err = sink_for(store, WriteMode::PerSample)
        .setup(true)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Setup(_)));

    let healthy = Arc::new(FakeStore::default());
    sink_for(healthy.clone(), WriteMode::PerSample)
        .setup(true)
        .await
        .unwrap();
    assert!(healthy.recreated.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn unreachable_server_gives_up_after_max_retries() {
    let connector = Arc::new(FakeConnector::new(Vec::new()));
    let store = Arc::new(FakeStore::default());
    let started = tokio::time::Instant::now();

    let report = controller(
        connector.clone(),
        sink_for(store, WriteMode::PerSample),
        selectors(&[&["IU", "ANMO", "BHZ"]]),
        policy(5, RetryBudget::Lifetime),
    )
    .run(CancellationToken::new())
    .await;

    assert_eq!(report.reason, StopReason::RetriesExhausted);
    assert_eq!(report.final_state, ControllerState::Stopped);
    assert_eq!(report.attempts, 5);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 5);
    assert_eq!(
        report.waits,
        [5, 10, 20, 40].map(Duration::from_secs).to_vec()
    );
    assert_eq!(started.elapsed(), Duration::from_secs(75));
}

#[tokio::test(start_paused = true)]
async fn recovers_after_failures_with_doubling_waits() {
    let connector = Arc::new(FakeConnector::new(vec![
        Attempt::Refuse,
        Attempt::Refuse,
        Attempt::Session(vec![Step::Packet(anmo_packet()), Step::Close]),
    ]));
    let store = Arc::new(FakeStore::default());

    let report = controller(
        connector,
        sink_for(store.clone(), WriteMode::PerSample),
        selectors(&[&["IU", "ANMO", "BHZ"]]),
        policy(5, RetryBudget::Lifetime),
    )
    .run(CancellationToken::new())
    .await;

    assert_eq!(report.reason, StopReason::Closed);
    assert_eq!(report.attempts, 3);
    assert_eq!(report.waits, vec![Duration::from_secs(5), Duration::from_secs(10)]);
    assert_eq!(report.sessions_streamed, 1);
    assert_eq!(store.rows().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn mid_stream_drop_keeps_persisted_rows_and_reconnects() {
    let connector = Arc::new(FakeConnector::new(vec![
        Attempt::Session(vec![Step::Packet(anmo_packet()), Step::Drop]),
        Attempt::Session(vec![Step::Packet(anmo_packet()), Step::Close]),
    ]));
    let store = Arc::new(FakeStore::default());

    let report = controller(
        connector,
        sink_for(store.clone(), WriteMode::PerSample),
        selectors(&[&["IU", "ANMO", "BHZ"]]),
        policy(5, RetryBudget::Lifetime),
    )
    .run(CancellationToken::new())
    .await;

    assert_eq!(report.reason, StopReason::Closed);
    assert_eq!(report.attempts, 2);
    assert_eq!(report.sessions_streamed, 2);
    assert_eq!(report.waits, vec![Duration::from_secs(5)]);
    assert_eq!(store.rows().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn retry_budget_policies_differ_after_streaming() {
    let script = || {
        vec![
            Attempt::Refuse,
            Attempt::Session(vec![Step::Drop]),
            Attempt::Refuse,
            Attempt::Refuse,
            Attempt::Refuse,
        ]
    };

    let lifetime = controller(
        Arc::new(FakeConnector::new(script())),
        sink_for(Arc::new(FakeStore::default()), WriteMode::PerSample),
        selectors(&[&["IU", "ANMO", "BHZ"]]),
        policy(3, RetryBudget::Lifetime),
    )
    .run(CancellationToken::new())
    .await;
    assert_eq!(lifetime.reason, StopReason::RetriesExhausted);
    assert_eq!(lifetime.attempts, 3);

    let reset = controller(
        Arc::new(FakeConnector::new(script())),
        sink_for(Arc::new(FakeStore::default()), WriteMode::PerSample),
        selectors(&[&["IU", "ANMO", "BHZ"]]),
        policy(3, RetryBudget::ResetOnStreaming),
    )
    .run(CancellationToken::new())
    .await;
    assert_eq!(reset.reason, StopReason::RetriesExhausted);
    assert_eq!(reset.attempts, 4);
    assert_eq!(
        reset.waits,
        [5, 5, 10].map(Duration::from_secs).to_vec()
    );
}

#[tokio::test(start_paused = true)]
async fn cancel_during_backoff_stops_without_another_attempt() {
    let connector = Arc::new(FakeConnector::new(Vec::new()));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(
        controller(
            connector.clone(),
            sink_for(Arc::new(FakeStore::default()), WriteMode::PerSample),
            selectors(&[&["IU", "ANMO", "BHZ"]]),
            policy(5, RetryBudget::Lifetime),
        )
        .run(cancel.clone()),
    );

    tokio::time::sleep(Duration::from_secs(7)).await;
    cancel.cancel();
    let report = handle.await.unwrap();

    assert_eq!(report.reason, StopReason::Cancelled);
    assert_eq!(report.final_state, ControllerState::Stopped);
    assert_eq!(report.attempts, 2);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn idle_stream_reports_streaming_state() {
    let connector = Arc::new(FakeConnector::new(vec![Attempt::Session(Vec::new())]));
    let cancel = CancellationToken::new();
    let controller = controller(
        connector,
        sink_for(Arc::new(FakeStore::default()), WriteMode::PerSample),
        selectors(&[&["IU", "ANMO", "BHZ"]]),
        policy(5, RetryBudget::Lifetime),
    );
    let mut state = controller.state();
    let handle = tokio::spawn(controller.run(cancel.clone()));

    state
        .wait_for(|current| *current == ControllerState::Streaming)
        .await
        .unwrap();
    cancel.cancel();
    let report = handle.await.unwrap();
    assert_eq!(report.reason, StopReason::Cancelled);
    assert_eq!(report.sessions_streamed, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_stuck_writes_and_bounds_pool_close() {
    let store = Arc::new(FakeStore {
        hang_inserts: true,
        hang_close: true,
        ..FakeStore::default()
    });
    let stats = Arc::new(IngestStats::new());
    let sink = PersistenceSink::new(store.clone(), stats.clone(), WriteMode::PerSample, 500);
    let coordinator = ShutdownCoordinator::new(store.clone(), stats.clone(), Duration::from_secs(2));

    let connector = Arc::new(FakeConnector::new(vec![Attempt::Session(vec![Step::Packet(
        anmo_packet(),
    )])]));
    let mut workers = JoinSet::new();
    workers.spawn(
        controller(
            connector,
            sink,
            selectors(&[&["IU", "ANMO", "BHZ"]]),
            policy(5, RetryBudget::Lifetime),
        )
        .run(coordinator.token()),
    );

    while stats.packets_received.load(Ordering::Relaxed) == 0 {
        tokio::task::yield_now().await;
    }

    let token = coordinator.token();
    let started = tokio::time::Instant::now();
    coordinator.on_signal("SIGTERM", &mut workers).await;

    assert!(token.is_cancelled());
    assert_eq!(started.elapsed(), Duration::from_secs(2));
    assert!(!store.closed.load(Ordering::SeqCst));
    let joined = workers.join_next().await.unwrap();
    assert!(joined.unwrap_err().is_cancelled());
    assert!(store.rows().is_empty());
}

#[tokio::test]
async fn shutdown_closes_the_pool_once_workers_finish() {
    let store = Arc::new(FakeStore::default());
    let coordinator = ShutdownCoordinator::new(
        store.clone(),
        Arc::new(IngestStats::new()),
        Duration::from_secs(2),
    );
    let token = coordinator.token();
    coordinator.on_workers_finished().await;
    assert!(token.is_cancelled());
    assert!(store.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_questdb_persists_expanded_packet() -> Result<()> {
    if env::var("SEISMIC_INTEGRATION_TEST").ok().as_deref() != Some("1") {
        return Ok(());
    }
    let database_url = match env::var("SEISMIC_TEST_DATABASE_URL") {
        Ok(value) => value,
        Err(_) => return Ok(()),
    };

    let pool = build_pool(&StoreConfig {
        database_url: Some(database_url),
        host: String::new(),
        port: 0,
        database: String::new(),
        user: String::new(),
        password: String::new(),
        pool_min: 0,
        pool_max: 2,
        acquire_timeout_secs: 10,
    })?;
    let store = Arc::new(QuestDbStore::new(pool.clone()));
    let sink = PersistenceSink::new(
        store.clone(),
        Arc::new(IngestStats::new()),
        WriteMode::PerSample,
        500,
    );
    sink.setup(true).await?;

    let summary = sink.write_packet(super::expand(&anmo_packet())).await;
    assert_eq!(summary.written, 3);

    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM seismic_events WHERE station_id = $1")
            .bind("IU.ANMO.00.BHZ")
            .fetch_one(&pool)
            .await?;
    assert_eq!(count, 3);

    store.close().await;
    Ok(())
}
