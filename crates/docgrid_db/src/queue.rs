//! Job queue store.
//!
//! Provides atomic job leasing via `UPDATE ... WHERE status = 'queued'`
//! inside a transaction, so concurrent lease attempts never claim the same
//! job twice.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use docgrid_protocol::{JobStatus, JobType};
use sqlx::{Pool, QueryBuilder, Sqlite};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::{DbError, Result};
use crate::models::QueueJob;

/// Outcome of `fail_job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job moved to `retrying` and will re-enter the queue.
    RetryScheduled { attempts: i64 },
    /// The job reached `failed` and will not run again without manual retry.
    FinalFailure,
}

/// Scope for `retry_failed`.
#[derive(Debug, Clone)]
pub enum RetryScope {
    Job(String),
    Project(String),
}

#[derive(Debug, Clone, Copy, Default, sqlx::FromRow)]
pub struct QueueStats {
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: Pool<Sqlite>,
}

impl JobQueue {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Create a new job in `queued` with zero attempts.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_job(
        &self,
        job_type: JobType,
        project_id: &str,
        batch_id: &str,
        payload: &str,
        priority: i64,
        max_attempts: i64,
        now: DateTime<Utc>,
    ) -> Result<QueueJob> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO queue_jobs
                (id, job_type, status, priority, project_id, batch_id, payload,
                 attempts, max_attempts, created_at)
            VALUES (?, ?, 'queued', ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(job_type.as_str())
        .bind(priority)
        .bind(project_id)
        .bind(batch_id)
        .bind(payload)
        .bind(max_attempts)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let job: QueueJob = sqlx::query_as("SELECT * FROM queue_jobs WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;

        info!(job_id = %job.id, job_type = %job.job_type, batch_id, "Job enqueued");
        Ok(job)
    }

    /// Atomically lease the next eligible job.
    ///
    /// Selection order is `(priority ASC, created_at ASC, id ASC)`; the id
    /// is the deterministic tie-break. Returns `None` when the queue has no
    /// eligible job or another worker won the race.
    pub async fn lease_next(&self, now: DateTime<Utc>) -> Result<Option<QueueJob>> {
        let mut tx = self.pool.begin().await?;

        let job_id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM queue_jobs
            WHERE status = 'queued'
            ORDER BY priority ASC, created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job_id) = job_id else {
            tx.commit().await?;
            return Ok(None);
        };

        let rows_affected = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'processing',
                started_at = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(now)
        .bind(&job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Claimed by a concurrent lease between select and update.
            tx.commit().await?;
            return Ok(None);
        }

        let job: QueueJob = sqlx::query_as("SELECT * FROM queue_jobs WHERE id = ?")
            .bind(&job_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(job_id = %job.id, job_type = %job.job_type, "Leased job");
        Ok(Some(job))
    }

    /// Transition `processing -> completed`. Idempotent on already-completed
    /// jobs; returns `InvalidState` when the job was canceled mid-flight so
    /// the caller can discard its write.
    pub async fn complete_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'completed',
                completed_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected > 0 {
            info!(job_id, "Job completed");
            return Ok(());
        }

        match self.get_job(job_id).await? {
            None => Err(DbError::not_found(format!("job {job_id}"))),
            Some(job) if job.status == JobStatus::Completed => Ok(()),
            Some(job) => Err(DbError::invalid_state(format!(
                "cannot complete job {job_id} in status {}",
                job.status
            ))),
        }
    }

    /// Record a job failure.
    ///
    /// Attempts are incremented first; a retriable failure with attempts
    /// still below `max_attempts` parks the job in `retrying` until
    /// `retry_at`, everything else is final.
    pub async fn fail_job(
        &self,
        job_id: &str,
        error: &str,
        retriable: bool,
        backoff: Duration,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome> {
        let mut tx = self.pool.begin().await?;

        let job: Option<QueueJob> = sqlx::query_as("SELECT * FROM queue_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(job) = job else {
            return Err(DbError::not_found(format!("job {job_id}")));
        };
        if job.status != JobStatus::Processing {
            return Err(DbError::invalid_state(format!(
                "cannot fail job {job_id} in status {}",
                job.status
            )));
        }

        let attempts = job.attempts + 1;
        let outcome = if retriable && attempts < job.max_attempts {
            let retry_at = now + ChronoDuration::milliseconds(backoff.as_millis() as i64);
            sqlx::query(
                r#"
                UPDATE queue_jobs
                SET status = 'retrying',
                    attempts = ?,
                    error = ?,
                    started_at = NULL,
                    retry_at = ?
                WHERE id = ?
                "#,
            )
            .bind(attempts)
            .bind(error)
            .bind(retry_at)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
            FailOutcome::RetryScheduled { attempts }
        } else {
            sqlx::query(
                r#"
                UPDATE queue_jobs
                SET status = 'failed',
                    attempts = ?,
                    error = ?,
                    completed_at = ?
                WHERE id = ?
                "#,
            )
            .bind(attempts)
            .bind(error)
            .bind(now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
            FailOutcome::FinalFailure
        };

        tx.commit().await?;
        info!(job_id, attempts, ?outcome, "Job failed: {}", error);
        Ok(outcome)
    }

    /// Return due `retrying` jobs to `queued`.
    pub async fn release_due_retries(&self, now: DateTime<Utc>) -> Result<u64> {
        let released = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'queued',
                retry_at = NULL
            WHERE status = 'retrying' AND retry_at <= ?
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if released > 0 {
            info!(released, "Released retrying jobs back to the queue");
        }
        Ok(released)
    }

    /// Cancel all non-terminal jobs for a project, optionally restricted to
    /// a batch set. Terminal jobs are untouched, so the call is idempotent.
    pub async fn cancel_jobs(
        &self,
        project_id: &str,
        batch_ids: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE queue_jobs SET status = 'canceled', completed_at = ");
        qb.push_bind(now);
        qb.push(" WHERE project_id = ");
        qb.push_bind(project_id);
        qb.push(" AND status IN ('queued', 'processing', 'retrying')");
        if let Some(ids) = batch_ids {
            if ids.is_empty() {
                return Ok(0);
            }
            qb.push(" AND batch_id IN (");
            let mut separated = qb.separated(", ");
            for id in ids {
                separated.push_bind(id);
            }
            qb.push(")");
        }

        let canceled = qb.build().execute(&self.pool).await?.rows_affected();
        if canceled > 0 {
            info!(project_id, canceled, "Canceled jobs");
        }
        Ok(canceled)
    }

    /// Cancel orphaned `processing` jobs. Only valid while no worker holds a
    /// lease (startup reconciliation).
    pub async fn cancel_orphaned_processing(&self, now: DateTime<Utc>) -> Result<u64> {
        let canceled = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'canceled',
                completed_at = ?,
                error = 'orphaned by process restart'
            WHERE status = 'processing'
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if canceled > 0 {
            info!(canceled, "Canceled orphaned in-flight jobs");
        }
        Ok(canceled)
    }

    /// Move `failed` jobs back to `queued` with attempts reset. Jobs in any
    /// other state are skipped.
    pub async fn retry_failed(&self, scope: &RetryScope) -> Result<u64> {
        let query = match scope {
            RetryScope::Job(job_id) => sqlx::query(
                r#"
                UPDATE queue_jobs
                SET status = 'queued', attempts = 0, error = NULL,
                    started_at = NULL, completed_at = NULL, retry_at = NULL
                WHERE id = ? AND status = 'failed'
                "#,
            )
            .bind(job_id),
            RetryScope::Project(project_id) => sqlx::query(
                r#"
                UPDATE queue_jobs
                SET status = 'queued', attempts = 0, error = NULL,
                    started_at = NULL, completed_at = NULL, retry_at = NULL
                WHERE project_id = ? AND status = 'failed'
                "#,
            )
            .bind(project_id),
        };

        let retried = query.execute(&self.pool).await?.rows_affected();
        if retried > 0 {
            info!(retried, "Requeued failed jobs");
        }
        Ok(retried)
    }

    /// Point-in-time counts by status.
    pub async fn stats(&self, project_id: Option<&str>) -> Result<QueueStats> {
        let stats: QueueStats = match project_id {
            Some(project_id) => {
                sqlx::query_as(
                    r#"
                    SELECT
                        COUNT(*) FILTER (WHERE status = 'queued') as queued,
                        COUNT(*) FILTER (WHERE status = 'processing') as processing,
                        COUNT(*) FILTER (WHERE status = 'completed') as completed,
                        COUNT(*) FILTER (WHERE status = 'failed') as failed,
                        COUNT(*) as total
                    FROM queue_jobs
                    WHERE project_id = ?
                    "#,
                )
                .bind(project_id)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT
                        COUNT(*) FILTER (WHERE status = 'queued') as queued,
                        COUNT(*) FILTER (WHERE status = 'processing') as processing,
                        COUNT(*) FILTER (WHERE status = 'completed') as completed,
                        COUNT(*) FILTER (WHERE status = 'failed') as failed,
                        COUNT(*) as total
                    FROM queue_jobs
                    "#,
                )
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(stats)
    }

    /// Fetch a job snapshot.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<QueueJob>> {
        let job = sqlx::query_as("SELECT * FROM queue_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    async fn queue() -> (Store, JobQueue) {
        let store = Store::open_memory().await.unwrap();
        let queue = store.queue();
        (store, queue)
    }

    async fn enqueue(queue: &JobQueue, batch: &str, priority: i64) -> QueueJob {
        queue
            .create_job(
                JobType::ProcessBatch,
                "p1",
                batch,
                r#"{"batch_id":"b1"}"#,
                priority,
                3,
                Utc::now(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_lease_empty_queue() {
        let (_store, queue) = queue().await;
        assert!(queue.lease_next(Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_priority_then_creation_order() {
        let (_store, queue) = queue().await;
        enqueue(&queue, "b-low", 10).await;
        enqueue(&queue, "b-urgent", 5).await;
        enqueue(&queue, "b-low-2", 10).await;

        let first = queue.lease_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(first.batch_id, "b-urgent");
        assert_eq!(first.status, JobStatus::Processing);
        assert!(first.started_at.is_some());

        let second = queue.lease_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(second.batch_id, "b-low");

        let third = queue.lease_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(third.batch_id, "b-low-2");

        assert!(queue.lease_next(Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_is_idempotent_but_rejects_canceled() {
        let (_store, queue) = queue().await;
        let job = enqueue(&queue, "b1", 10).await;
        let leased = queue.lease_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(leased.id, job.id);

        queue.complete_job(&job.id, Utc::now()).await.unwrap();
        // Second completion is a no-op.
        queue.complete_job(&job.id, Utc::now()).await.unwrap();

        let canceled = enqueue(&queue, "b2", 10).await;
        queue.lease_next(Utc::now()).await.unwrap().unwrap();
        queue.cancel_jobs("p1", None, Utc::now()).await.unwrap();
        let err = queue.complete_job(&canceled.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_fail_job_schedules_retry_then_final() {
        let (_store, queue) = queue().await;
        let job = enqueue(&queue, "b1", 10).await;
        let backoff = Duration::from_secs(5);

        // Attempt 1 and 2 retry, attempt 3 is final.
        for expected_attempts in 1..3 {
            queue.lease_next(Utc::now()).await.unwrap().unwrap();
            let outcome = queue
                .fail_job(&job.id, "llm timeout", true, backoff, Utc::now())
                .await
                .unwrap();
            assert_eq!(
                outcome,
                FailOutcome::RetryScheduled {
                    attempts: expected_attempts
                }
            );
            let released = queue
                .release_due_retries(Utc::now() + ChronoDuration::seconds(6))
                .await
                .unwrap();
            assert_eq!(released, 1);
        }

        queue.lease_next(Utc::now()).await.unwrap().unwrap();
        let outcome = queue
            .fail_job(&job.id, "llm timeout", true, backoff, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::FinalFailure);

        let job = queue.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_non_retriable_failure_is_final_on_first_attempt() {
        let (_store, queue) = queue().await;
        let job = enqueue(&queue, "b1", 10).await;
        queue.lease_next(Utc::now()).await.unwrap().unwrap();

        let outcome = queue
            .fail_job(&job.id, "empty batch", false, Duration::from_secs(5), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::FinalFailure);
    }

    #[tokio::test]
    async fn test_retry_before_backoff_not_released() {
        let (_store, queue) = queue().await;
        let job = enqueue(&queue, "b1", 10).await;
        queue.lease_next(Utc::now()).await.unwrap().unwrap();
        let now = Utc::now();
        queue
            .fail_job(&job.id, "boom", true, Duration::from_secs(5), now)
            .await
            .unwrap();

        assert_eq!(queue.release_due_retries(now).await.unwrap(), 0);
        assert!(queue.lease_next(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_scoped_by_batch_and_idempotent() {
        let (_store, queue) = queue().await;
        enqueue(&queue, "b1", 10).await;
        enqueue(&queue, "b2", 10).await;

        let batch_filter = vec!["b1".to_string()];
        let canceled = queue
            .cancel_jobs("p1", Some(&batch_filter), Utc::now())
            .await
            .unwrap();
        assert_eq!(canceled, 1);

        // Already-canceled jobs are untouched on repeat.
        let canceled = queue
            .cancel_jobs("p1", Some(&batch_filter), Utc::now())
            .await
            .unwrap();
        assert_eq!(canceled, 0);

        let stats = queue.stats(Some("p1")).await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.total, 2);
    }

    #[tokio::test]
    async fn test_retry_failed_resets_attempts() {
        let (_store, queue) = queue().await;
        let job = enqueue(&queue, "b1", 10).await;
        queue.lease_next(Utc::now()).await.unwrap().unwrap();
        queue
            .fail_job(&job.id, "boom", false, Duration::from_secs(5), Utc::now())
            .await
            .unwrap();

        let retried = queue
            .retry_failed(&RetryScope::Job(job.id.clone()))
            .await
            .unwrap();
        assert_eq!(retried, 1);

        let job = queue.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.error.is_none());

        // Retrying a queued job is a no-op.
        let retried = queue.retry_failed(&RetryScope::Job(job.id)).await.unwrap();
        assert_eq!(retried, 0);
    }
}
