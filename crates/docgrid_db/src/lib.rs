//! Durable store for the DocGrid engine.
//!
//! The store is the single point of durable mutation: every state change on
//! a job, batch, or row passes through one of its sub-stores, and every
//! operation either fully succeeds or leaves the database unchanged.
//!
//! # Example
//!
//! ```rust,ignore
//! use docgrid_db::Store;
//!
//! let store = Store::open("sqlite:docgrid.db").await?;
//! let job = store.queue().lease_next(Utc::now()).await?;
//! ```

pub mod batches;
pub mod error;
pub mod metrics;
pub mod models;
pub mod projects;
pub mod queue;
pub mod schema;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

pub use batches::BatchStore;
pub use error::{DbError, Result};
pub use metrics::MetricStore;
pub use models::{
    BatchRecord, ImageRecord, MetricRecord, MetricStatus, NewImage, NewMetric, ProjectRecord,
    QueueJob, RowRecord,
};
pub use projects::ProjectStore;
pub use queue::{FailOutcome, JobQueue, QueueStats, RetryScope};

/// Handle to the shared database. Cloning is cheap; all sub-stores share
/// the same pool.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Open (creating if necessary) the database at `url` and apply the
    /// schema.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(DbError::Sqlx)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        schema::ensure_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. Connections share the same
    /// in-memory database via SQLite's shared cache so concurrent
    /// callers (e.g. parallel pipelines) don't deadlock on a single
    /// connection.
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("file::memory:?cache=shared")
            .map_err(DbError::Sqlx)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .min_connections(8)
            .connect_with(options)
            .await?;
        schema::ensure_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn queue(&self) -> JobQueue {
        JobQueue::new(self.pool.clone())
    }

    pub fn batches(&self) -> BatchStore {
        BatchStore::new(self.pool.clone())
    }

    pub fn projects(&self) -> ProjectStore {
        ProjectStore::new(self.pool.clone())
    }

    pub fn metrics(&self) -> MetricStore {
        MetricStore::new(self.pool.clone())
    }

    /// Startup reconciliation: cancel orphaned in-flight jobs, then return
    /// stale `processing` batches to `pending`. MUST run to completion
    /// before the worker takes its first lease.
    pub async fn reset_stale(&self, now: DateTime<Utc>) -> Result<StaleSweep> {
        let canceled_jobs = self.queue().cancel_orphaned_processing(now).await?;
        let reset_batches = self.batches().reset_stale_batches(now).await?;
        Ok(StaleSweep {
            canceled_jobs,
            reset_batches,
        })
    }
}

/// Result of the startup reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleSweep {
    pub canceled_jobs: u64,
    pub reset_batches: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use docgrid_protocol::{BatchStatus, JobStatus, JobType};

    #[tokio::test]
    async fn test_reset_stale_converges_batches_and_jobs() {
        let store = Store::open_memory().await.unwrap();
        let now = Utc::now();

        // A batch stuck in processing with an orphaned in-flight job.
        let stuck = store.batches().create_batch("p1", now).await.unwrap();
        store.batches().mark_processing(&stuck.id, now).await.unwrap();
        let job = store
            .queue()
            .create_job(
                JobType::ProcessBatch,
                "p1",
                &stuck.id,
                "{\"batch_id\":\"x\"}",
                10,
                3,
                now,
            )
            .await
            .unwrap();
        store.queue().lease_next(now).await.unwrap().unwrap();

        // A batch whose job is still queued keeps its state.
        let covered = store.batches().create_batch("p1", now).await.unwrap();
        store.batches().mark_processing(&covered.id, now).await.unwrap();
        store
            .queue()
            .create_job(
                JobType::ProcessBatch,
                "p1",
                &covered.id,
                "{\"batch_id\":\"y\"}",
                10,
                3,
                now,
            )
            .await
            .unwrap();

        let sweep = store.reset_stale(now).await.unwrap();
        assert_eq!(sweep.canceled_jobs, 1);
        assert_eq!(sweep.reset_batches, 1);

        let stuck = store.batches().get_batch(&stuck.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, BatchStatus::Pending);
        assert!(stuck.error.is_none());

        let covered = store.batches().get_batch(&covered.id).await.unwrap().unwrap();
        assert_eq!(covered.status, BatchStatus::Processing);

        let job = store.queue().get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceled);

        // The sweep is idempotent.
        let sweep = store.reset_stale(now).await.unwrap();
        assert_eq!(sweep, StaleSweep::default());
    }
}
