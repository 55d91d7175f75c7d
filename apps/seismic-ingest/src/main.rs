mod cli;
mod config;
mod diagnostics;
mod error;
mod feed;
mod ingest;
mod pipeline;
mod shutdown;
mod store;

use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::feed::{FeedConnector, SeedLinkConnector};
use crate::ingest::PersistenceSink;
use crate::pipeline::{drain_workers, spawn_workers, IngestStats};
use crate::shutdown::{ShutdownCoordinator, ShutdownSignals};
use crate::store::{build_pool, QuestDbStore, SampleStore};
use anyhow::{Context, Result};
use clap::Parser;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Arc;

fn open_log_file(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,seismic_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);
    let file_layer = match &config.log_file {
        Some(path) => {
            let file = open_log_file(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "seismic-ingest"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(file_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(file_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn run_service(config: Config) -> Result<()> {
    let mut signals = ShutdownSignals::register()?;
    let pool = build_pool(&config.store)?;
    let store: Arc<dyn SampleStore> = Arc::new(QuestDbStore::new(pool));
    let stats = Arc::new(IngestStats::new());
    let sink = PersistenceSink::new(
        store.clone(),
        stats.clone(),
        config.write_mode,
        config.progress_every,
    );

    tracing::info!(
        store = %config.store.display_target(),
        feeds = config.feeds.len(),
        write_mode = ?config.write_mode,
        "starting seismic data stream processor"
    );
    // Setup failure is logged by the sink; the workers still start so the
    // per-sample write errors surface once the store is reachable again.
    let _ = sink.setup(config.recreate_table).await;

    let coordinator = ShutdownCoordinator::new(store, stats, config.shutdown_grace());
    let connector: Arc<dyn FeedConnector> = Arc::new(SeedLinkConnector::new(config.connect_timeout()));
    let mut workers = spawn_workers(
        &config.feeds,
        connector,
        sink,
        config.reconnect_policy(),
        coordinator.token(),
    );

    let signal = tokio::select! {
        signal = signals.recv() => Some(signal),
        _ = drain_workers(&mut workers) => None,
    };

    match signal {
        Some(signal) => coordinator.on_signal(signal, &mut workers).await,
        None => coordinator.on_workers_finished().await,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(&config)?;

    match cli.command() {
        Commands::Run => run_service(config).await,
        Commands::CheckStore => {
            let pool = build_pool(&config.store)?;
            diagnostics::check_store(&pool).await;
            pool.close().await;
            Ok(())
        }
        Commands::Report(args) => {
            let pool = build_pool(&config.store)?;
            diagnostics::report(&pool, args.recent).await;
            pool.close().await;
            Ok(())
        }
    }
}
