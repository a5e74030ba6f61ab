//! The long-horizon sample store.
//!
//! Append-only: the flush worker is the sole writer and commits each drained
//! window as one transaction. A failed batch is discarded wholesale; samples
//! are monitoring data and the next window supersedes them.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::todo,
    missing_debug_implementations,
    missing_docs
)]

use std::path::Path;
use std::str::FromStr;

use data_types::{AggregationKind, ResourceId, Sample};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;

/// Errors returned by the sample store.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying database rejected the statement.
    #[error("sample store error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// A specialized `Result` for sample store operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sample (
        time             INTEGER NOT NULL,
        resource_id      INTEGER NOT NULL,
        metric_type      TEXT NOT NULL,
        value            REAL NOT NULL,
        aggregation_kind TEXT NOT NULL DEFAULT 'raw'
    )",
    "CREATE INDEX IF NOT EXISTS sample_resource_time ON sample (resource_id, time)",
];

/// The analytical store of flushed samples.
#[derive(Debug, Clone)]
pub struct SampleStore {
    pool: SqlitePool,
}

impl SampleStore {
    /// Open (creating if missing) the store database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        Self::init(SqlitePoolOptions::new().connect_with(options).await?).await
    }

    /// An in-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::init(
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await?,
        )
        .await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Append all of `samples` in a single transaction.
    ///
    /// On error nothing is persisted and the whole batch is lost to the
    /// caller.
    pub async fn batch_insert(&self, samples: &[Sample]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for sample in samples {
            sqlx::query(
                "INSERT INTO sample (time, resource_id, metric_type, value, aggregation_kind)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(sample.time)
            .bind(sample.resource_id.get())
            .bind(&sample.metric_type)
            .bind(sample.value)
            .bind(sample.aggregation_kind.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(samples.len())
    }

    /// All samples recorded for `resource_id`, in time order.
    ///
    /// Historical query surfaces build on this; it also backs the test
    /// suites.
    pub async fn samples_for_resource(&self, resource_id: i64) -> Result<Vec<Sample>> {
        let rows = sqlx::query_as::<_, (i64, i64, String, f64)>(
            "SELECT time, resource_id, metric_type, value
             FROM sample
             WHERE resource_id = ?1
             ORDER BY time",
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;

        // This store only ever writes raw samples.
        Ok(rows
            .into_iter()
            .map(|(time, resource_id, metric_type, value)| Sample {
                time,
                resource_id: ResourceId::new(resource_id),
                metric_type,
                value,
                aggregation_kind: AggregationKind::Raw,
            })
            .collect())
    }

    /// Total number of persisted samples.
    pub async fn sample_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM sample")
            .fetch_one(&self.pool)
            .await?)
    }
}
