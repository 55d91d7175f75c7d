use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::ingest::SampleRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::str::FromStr;

pub const TABLE_NAME: &str = "seismic_events";

const COLUMNS: &str = "network, station, location, channel, station_id, \
     sample_index, amplitude, sampling_rate, \
     trace_start_time, trace_end_time, packet_samples, delta, \
     timestamp";

fn create_table_sql(if_not_exists: bool) -> String {
    let guard = if if_not_exists { "IF NOT EXISTS " } else { "" };
    format!(
        r#"
        CREATE TABLE {guard}{TABLE_NAME} (
            network SYMBOL,
            station SYMBOL,
            location SYMBOL,
            channel SYMBOL,
            station_id SYMBOL,
            sample_index LONG,
            amplitude DOUBLE,
            sampling_rate DOUBLE,
            trace_start_time TIMESTAMP,
            trace_end_time TIMESTAMP,
            packet_samples LONG,
            delta DOUBLE,
            timestamp TIMESTAMP
        ) TIMESTAMP(timestamp) PARTITION BY DAY
        "#
    )
}

fn insert_sql() -> String {
    format!(
        "INSERT INTO {TABLE_NAME} ({COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
    )
}

/// Persistence backend for sample records.
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Prepares the sink table. With `recreate` the table is dropped first.
    async fn create_table(&self, recreate: bool) -> Result<(), StoreError>;

    /// Inserts and commits a single row.
    async fn insert_sample(&self, record: &SampleRecord) -> Result<(), StoreError>;

    /// Inserts all rows of one packet in a single transaction.
    async fn insert_packet(&self, records: &[SampleRecord]) -> Result<(), StoreError>;

    /// Closes every pooled connection.
    async fn close(&self);
}

/// QuestDB reached through its Postgres wire endpoint.
#[derive(Clone, Debug)]
pub struct QuestDbStore {
    pool: PgPool,
}

impl QuestDbStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Builds a bounded pool without connecting; the first acquire dials the store.
pub fn build_pool(config: &StoreConfig) -> Result<PgPool> {
    let options = match &config.database_url {
        Some(url) => PgConnectOptions::from_str(url)
            .context("invalid SEISMIC_DATABASE_URL / DATABASE_URL")?,
        None => PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password),
    };

    let pool = PgPoolOptions::new()
        .min_connections(config.pool_min)
        .max_connections(config.pool_max)
        .acquire_timeout(config.acquire_timeout())
        .connect_lazy_with(options);
    Ok(pool)
}

#[async_trait]
impl SampleStore for QuestDbStore {
    async fn create_table(&self, recreate: bool) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        if recreate {
            sqlx::query(&format!("DROP TABLE IF EXISTS {TABLE_NAME}"))
                .execute(&mut *conn)
                .await?;
        }
        sqlx::query(&create_table_sql(!recreate))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn insert_sample(&self, record: &SampleRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&insert_sql())
            .bind(&record.network)
            .bind(&record.station)
            .bind(&record.location)
            .bind(&record.channel)
            .bind(&record.station_id)
            .bind(record.sample_index as i64)
            .bind(record.amplitude)
            .bind(record.sampling_rate_hz)
            .bind(record.packet_start_time.naive_utc())
            .bind(record.packet_end_time.naive_utc())
            .bind(record.packet_sample_count as i64)
            .bind(record.delta_seconds)
            .bind(record.sample_timestamp.naive_utc())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Rejected(format!(
                "no row inserted for {} sample {}",
                record.station_id, record.sample_index
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_packet(&self, records: &[SampleRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {TABLE_NAME} ({COLUMNS}) "));
        builder.push_values(records.iter(), |mut b, record| {
            b.push_bind(&record.network)
                .push_bind(&record.station)
                .push_bind(&record.location)
                .push_bind(&record.channel)
                .push_bind(&record.station_id)
                .push_bind(record.sample_index as i64)
                .push_bind(record.amplitude)
                .push_bind(record.sampling_rate_hz)
                .push_bind(record.packet_start_time.naive_utc())
                .push_bind(record.packet_end_time.naive_utc())
                .push_bind(record.packet_sample_count as i64)
                .push_bind(record.delta_seconds)
                .push_bind(record.sample_timestamp.naive_utc());
        });

        let mut tx = self.pool.begin().await?;
        let result = builder.build().execute(&mut *tx).await?;
        if result.rows_affected() != records.len() as u64 {
            return Err(StoreError::Rejected(format!(
                "inserted {} of {} rows",
                result.rows_affected(),
                records.len()
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
