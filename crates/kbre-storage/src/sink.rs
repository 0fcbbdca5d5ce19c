//! Destination store contract and its Postgres / in-memory implementations.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use kbre_core::{RegionMapping, StatRecord};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{error, info};

/// Rows per `real_estate_stats` upsert round trip.
pub const STATS_BATCH_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Message(String),
}

/// Operations the pipeline needs from the destination store.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Insert-or-replace by `kb_region_id`. Never deletes.
    async fn upsert_mapping(&self, records: &[RegionMapping]) -> Result<u64, SinkError>;

    /// Maximum stored `date` in `real_estate_stats`, `None` when the table is empty.
    async fn latest_stat_date(&self) -> Result<Option<NaiveDate>, SinkError>;

    /// Insert-or-update one batch keyed on `(date, kb_region_id)`.
    async fn upsert_stats_batch(&self, batch: &[StatRecord]) -> Result<u64, SinkError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub index: usize,
    pub rows: usize,
    pub error: Option<String>,
}

impl BatchOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadSummary {
    pub batches: Vec<BatchOutcome>,
}

impl UploadSummary {
    pub fn total_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn failed_batches(&self) -> usize {
        self.batches.iter().filter(|b| !b.is_ok()).count()
    }

    pub fn uploaded_rows(&self) -> usize {
        self.batches.iter().filter(|b| b.is_ok()).map(|b| b.rows).sum()
    }

    pub fn failed_rows(&self) -> usize {
        self.batches.iter().filter(|b| !b.is_ok()).map(|b| b.rows).sum()
    }
}

/// Uploads `records` in sequential batches. A failed batch is logged and the next one is
/// still attempted; nothing is rolled back.
pub async fn upload_stats_in_batches(
    sink: &dyn Sink,
    records: &[StatRecord],
    batch_size: usize,
) -> UploadSummary {
    let batch_size = batch_size.max(1);
    let total = records.len().div_ceil(batch_size);
    let mut summary = UploadSummary::default();

    for (i, batch) in records.chunks(batch_size).enumerate() {
        let outcome = match sink.upsert_stats_batch(batch).await {
            Ok(_) => {
                info!("uploading batch {}/{} ... ok ({} rows)", i + 1, total, batch.len());
                BatchOutcome {
                    index: i,
                    rows: batch.len(),
                    error: None,
                }
            }
            Err(err) => {
                error!("batch {}/{} upload failed: {err}", i + 1, total);
                BatchOutcome {
                    index: i,
                    rows: batch.len(),
                    error: Some(err.to_string()),
                }
            }
        };
        summary.batches.push(outcome);
    }

    summary
}

/// Postgres-backed sink over a single-connection pool.
#[derive(Debug, Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    /// Connects with `password` applied on top of `database_url`, so the URL can stay secret-free.
    pub async fn connect(database_url: &str, password: &str) -> Result<Self, SinkError> {
        let options = PgConnectOptions::from_str(database_url)?.password(password);
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn apply_migrations(&self) -> Result<(), SinkError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Sink for PgSink {
    async fn upsert_mapping(&self, records: &[RegionMapping]) -> Result<u64, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO region_mapping (kb_region_id, division_1, division_2, division_3, \
             display_name, view_nation, view_capital, view_individual, view_group_name, \
             view_order) ",
        );
        qb.push_values(records, |mut row, m| {
            row.push_bind(m.kb_region_id.clone())
                .push_bind(m.division_1.clone())
                .push_bind(m.division_2.clone())
                .push_bind(m.division_3.clone())
                .push_bind(m.display_name.clone())
                .push_bind(m.view_nation)
                .push_bind(m.view_capital)
                .push_bind(m.view_individual)
                .push_bind(m.view_group_name.clone())
                .push_bind(m.view_order);
        });
        qb.push(
            r#"
            ON CONFLICT (kb_region_id) DO UPDATE
               SET division_1 = EXCLUDED.division_1,
                   division_2 = EXCLUDED.division_2,
                   division_3 = EXCLUDED.division_3,
                   display_name = EXCLUDED.display_name,
                   view_nation = EXCLUDED.view_nation,
                   view_capital = EXCLUDED.view_capital,
                   view_individual = EXCLUDED.view_individual,
                   view_group_name = EXCLUDED.view_group_name,
                   view_order = EXCLUDED.view_order
            "#,
        );

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn latest_stat_date(&self) -> Result<Option<NaiveDate>, SinkError> {
        let latest: Option<NaiveDate> =
            sqlx::query_scalar("SELECT MAX(date) FROM real_estate_stats")
                .fetch_one(&self.pool)
                .await?;
        Ok(latest)
    }

    async fn upsert_stats_batch(&self, batch: &[StatRecord]) -> Result<u64, SinkError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO real_estate_stats (date, kb_region_id, sale_index, jeonse_index, \
             sale_change, jeonse_change) ",
        );
        qb.push_values(batch, |mut row, r| {
            row.push_bind(r.date)
                .push_bind(r.kb_region_id.clone())
                .push_bind(r.sale_index)
                .push_bind(r.jeonse_index)
                .push_bind(r.sale_change)
                .push_bind(r.jeonse_change);
        });
        qb.push(
            r#"
            ON CONFLICT (date, kb_region_id) DO UPDATE
               SET sale_index = EXCLUDED.sale_index,
                   jeonse_index = EXCLUDED.jeonse_index,
                   sale_change = EXCLUDED.sale_change,
                   jeonse_change = EXCLUDED.jeonse_change
            "#,
        );

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    mappings: BTreeMap<String, RegionMapping>,
    stats: BTreeMap<(NaiveDate, String), StatRecord>,
    stats_batches: usize,
}

/// In-process sink with the same upsert semantics as `PgSink`.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stats(records: impl IntoIterator<Item = StatRecord>) -> Self {
        let sink = Self::default();
        {
            let mut state = sink.lock();
            for record in records {
                state
                    .stats
                    .insert((record.date, record.kb_region_id.clone()), record);
            }
        }
        sink
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mappings(&self) -> Vec<RegionMapping> {
        self.lock().mappings.values().cloned().collect()
    }

    pub fn stats(&self) -> Vec<StatRecord> {
        self.lock().stats.values().cloned().collect()
    }

    pub fn stats_batches(&self) -> usize {
        self.lock().stats_batches
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn upsert_mapping(&self, records: &[RegionMapping]) -> Result<u64, SinkError> {
        let mut state = self.lock();
        for record in records {
            state
                .mappings
                .insert(record.kb_region_id.clone(), record.clone());
        }
        Ok(records.len() as u64)
    }

    async fn latest_stat_date(&self) -> Result<Option<NaiveDate>, SinkError> {
        Ok(self.lock().stats.keys().map(|(date, _)| *date).max())
    }

    async fn upsert_stats_batch(&self, batch: &[StatRecord]) -> Result<u64, SinkError> {
        let mut state = self.lock();
        state.stats_batches += 1;
        for record in batch {
            state
                .stats
                .insert((record.date, record.kb_region_id.clone()), record.clone());
        }
        Ok(batch.len() as u64)
    }
}
