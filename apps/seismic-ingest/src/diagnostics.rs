//! Operator checks against the store: a connectivity smoke test and a
//! read-only report on collected samples. Output goes to stdout.

use crate::store::TABLE_NAME;
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use sqlx::PgPool;
use std::fmt::Write as _;

const SCRATCH_TABLE: &str = "test_seismic";

#[derive(Debug, Clone, PartialEq)]
pub struct StationCount {
    pub station_id: Option<String>,
    pub samples: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AmplitudeRange {
    pub station_id: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecentSample {
    pub station_id: Option<String>,
    pub amplitude: Option<f64>,
    pub timestamp: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataReport {
    pub total_samples: i64,
    pub per_station: Vec<StationCount>,
    pub amplitudes: Vec<AmplitudeRange>,
    pub recent: Vec<RecentSample>,
    pub null_amplitudes: i64,
    pub null_station_ids: i64,
}

impl DataReport {
    pub fn quality_passed(&self) -> bool {
        self.null_amplitudes == 0 && self.null_station_ids == 0
    }
}

async fn list_tables(pool: &PgPool) -> Result<Vec<String>> {
    let tables: Vec<String> = sqlx::query_scalar("SHOW TABLES")
        .fetch_all(pool)
        .await
        .context("failed to list tables")?;
    Ok(tables)
}

async fn smoke_test(pool: &PgPool) -> Result<Vec<String>> {
    let one: i32 = sqlx::query_scalar("SELECT 1")
        .fetch_one(pool)
        .await
        .context("SELECT 1 failed")?;
    println!("store connection ok (SELECT 1 -> {one})");

    let tables = list_tables(pool).await?;
    println!("existing tables: {tables:?}");

    let mut conn = pool.acquire().await?;
    sqlx::query(&format!("DROP TABLE IF EXISTS {SCRATCH_TABLE}"))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE {SCRATCH_TABLE} (station_id SYMBOL, amplitude DOUBLE, timestamp TIMESTAMP) TIMESTAMP(timestamp)"
    ))
    .execute(&mut *conn)
    .await
    .context("scratch table creation failed")?;
    println!("scratch table created");
    sqlx::query(&format!("DROP TABLE {SCRATCH_TABLE}"))
        .execute(&mut *conn)
        .await
        .context("scratch table cleanup failed")?;
    println!("scratch table dropped");
    Ok(tables)
}

/// Runs the smoke test and prints the verdict. The exit code stays 0 either way.
pub async fn check_store(pool: &PgPool) {
    print!("{}", check_verdict(&smoke_test(pool).await));
}

fn check_verdict(outcome: &Result<Vec<String>>) -> String {
    match outcome {
        Ok(tables) => {
            let mut out = String::new();
            if !tables.iter().any(|table| table == TABLE_NAME) {
                let _ = writeln!(out, "note: {TABLE_NAME} does not exist yet");
            }
            let _ = writeln!(out, "store check PASSED");
            out
        }
        Err(err) => format!("store check FAILED: {err:#}\n"),
    }
}

/// Collects the report, or `None` when the events table does not exist.
pub async fn collect_report(pool: &PgPool, recent: u32) -> Result<Option<DataReport>> {
    if !list_tables(pool).await?.iter().any(|table| table == TABLE_NAME) {
        return Ok(None);
    }

    let total_samples: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {TABLE_NAME}"))
        .fetch_one(pool)
        .await?;

    let per_station: Vec<(Option<String>, i64)> = sqlx::query_as(&format!(
        "SELECT station_id, COUNT(*) AS sample_count FROM {TABLE_NAME} \
         GROUP BY station_id ORDER BY sample_count DESC"
    ))
    .fetch_all(pool)
    .await?;

    let amplitudes: Vec<(Option<String>, Option<f64>, Option<f64>, Option<f64>)> =
        sqlx::query_as(&format!(
            "SELECT station_id, MIN(amplitude), MAX(amplitude), AVG(amplitude) \
             FROM {TABLE_NAME} GROUP BY station_id"
        ))
        .fetch_all(pool)
        .await?;

    let recent_rows: Vec<(Option<String>, Option<f64>, Option<NaiveDateTime>)> =
        sqlx::query_as(&format!(
            "SELECT station_id, amplitude, timestamp FROM {TABLE_NAME} \
             ORDER BY timestamp DESC LIMIT {recent}"
        ))
        .fetch_all(pool)
        .await?;

    let null_amplitudes: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {TABLE_NAME} WHERE amplitude IS NULL"
    ))
    .fetch_one(pool)
    .await?;
    let null_station_ids: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {TABLE_NAME} WHERE station_id IS NULL"
    ))
    .fetch_one(pool)
    .await?;

    Ok(Some(DataReport {
        total_samples,
        per_station: per_station
            .into_iter()
            .map(|(station_id, samples)| StationCount { station_id, samples })
            .collect(),
        amplitudes: amplitudes
            .into_iter()
            .map(|(station_id, min, max, avg)| AmplitudeRange {
                station_id,
                min,
                max,
                avg,
            })
            .collect(),
        recent: recent_rows
            .into_iter()
            .map(|(station_id, amplitude, timestamp)| RecentSample {
                station_id,
                amplitude,
                timestamp,
            })
            .collect(),
        null_amplitudes,
        null_station_ids,
    }))
}

fn label(station_id: &Option<String>) -> &str {
    station_id.as_deref().unwrap_or("<null>")
}

fn amount(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.1}"))
}

pub fn render_report(report: &DataReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Total samples collected: {}", report.total_samples);

    let _ = writeln!(out, "\nSamples per station:");
    for row in &report.per_station {
        let _ = writeln!(out, "   {}: {} samples", label(&row.station_id), row.samples);
    }

    let _ = writeln!(out, "\nAmplitude statistics:");
    for row in &report.amplitudes {
        let _ = writeln!(
            out,
            "   {}: {} to {} (avg: {})",
            label(&row.station_id),
            amount(row.min),
            amount(row.max),
            amount(row.avg)
        );
    }

    let _ = writeln!(out, "\nRecent samples:");
    for row in &report.recent {
        let at = row
            .timestamp
            .map_or_else(|| "n/a".to_string(), |ts| ts.to_string());
        let _ = writeln!(
            out,
            "   {}: {} at {}",
            label(&row.station_id),
            amount(row.amplitude),
            at
        );
    }

    let _ = writeln!(out, "\nData quality:");
    let _ = writeln!(out, "   NULL amplitudes: {}", report.null_amplitudes);
    let _ = writeln!(out, "   NULL station_ids: {}", report.null_station_ids);
    if report.quality_passed() {
        let _ = writeln!(out, "Data quality PASSED");
    } else {
        let _ = writeln!(out, "Data quality issues detected");
    }
    out
}

/// Prints the validation report. Failures are printed, not propagated.
pub async fn report(pool: &PgPool, recent: u32) {
    match collect_report(pool, recent).await {
        Ok(Some(report)) => print!("{}", render_report(&report)),
        Ok(None) => println!("{TABLE_NAME} table not found"),
        Err(err) => println!("data validation failed: {err:#}"),
    }
}
