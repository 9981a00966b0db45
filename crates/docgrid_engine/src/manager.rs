//! Public enqueue/cancel/retry surface over the store.
//!
//! Every operation validates that the referenced batches belong to the
//! given project. Verifying that the *caller* owns the project is the
//! adapter's job (`ProjectStore::owned_by`); the core enforces batch to
//! project membership only.

use std::collections::BTreeMap;

use chrono::Utc;
use docgrid_db::{BatchRecord, DbError, QueueJob, QueueStats, RetryScope, Store};
use docgrid_protocol::defaults::{
    CANCELED_BY_USER_MESSAGE, DEFAULT_BATCH_PRIORITY, DEFAULT_MAX_ATTEMPTS, DEFAULT_REDO_PRIORITY,
};
use docgrid_protocol::{BatchStatus, JobType, ProcessBatchPayload, RedoPayload};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("batch {0} not found")]
    UnknownBatch(String),

    #[error("batch {batch_id} does not belong to project {project_id}")]
    ProjectMismatch {
        batch_id: String,
        project_id: String,
    },

    #[error("invalid redo request: {0}")]
    InvalidRedo(String),
}

pub type Result<T> = std::result::Result<T, ManagerError>;

/// Result of `enqueue_many`: jobs created so far survive a mid-group
/// failure; the caller gets both.
#[derive(Debug, Clone)]
pub struct EnqueueManyOutcome {
    pub job_ids: Vec<String>,
    /// Index into the input batch list and the error that stopped the group.
    pub failed: Option<(usize, String)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelOutcome {
    pub canceled_jobs: u64,
    pub reset_batches: u64,
}

#[derive(Clone)]
pub struct QueueManager {
    store: Store,
}

impl QueueManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Enqueue one full-batch extraction. Additive: no deduplication
    /// against prior jobs for the same batch; cancel first for replacement
    /// semantics.
    pub async fn enqueue_batch(
        &self,
        batch_id: &str,
        project_id: &str,
        priority: Option<i64>,
    ) -> Result<QueueJob> {
        self.checked_batch(batch_id, project_id).await?;
        self.create_batch_job(JobType::ProcessBatch, batch_id, project_id, priority)
            .await
    }

    /// Enqueue a group of batches. Already-created jobs are kept if a later
    /// creation fails.
    pub async fn enqueue_many(
        &self,
        batch_ids: &[String],
        project_id: &str,
        priority: Option<i64>,
    ) -> Result<EnqueueManyOutcome> {
        let mut job_ids = Vec::with_capacity(batch_ids.len());
        for (index, batch_id) in batch_ids.iter().enumerate() {
            match self.enqueue_batch(batch_id, project_id, priority).await {
                Ok(job) => job_ids.push(job.id),
                Err(error) => {
                    return Ok(EnqueueManyOutcome {
                        job_ids,
                        failed: Some((index, error.to_string())),
                    })
                }
            }
        }
        Ok(EnqueueManyOutcome {
            job_ids,
            failed: None,
        })
    }

    /// Reset a batch to `pending` (clearing its rows) and enqueue a
    /// re-extraction. Pipeline behavior is identical to `process_batch`;
    /// only the intent differs.
    pub async fn reprocess_batch(
        &self,
        batch_id: &str,
        project_id: &str,
        priority: Option<i64>,
    ) -> Result<QueueJob> {
        self.checked_batch(batch_id, project_id).await?;
        self.store
            .batches()
            .set_status(batch_id, BatchStatus::Pending, Utc::now())
            .await?;
        self.create_batch_job(JobType::ReprocessBatch, batch_id, project_id, priority)
            .await
    }

    /// Enqueue a field-scoped redo for one row. Every redo column must be
    /// covered by a cropped image.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue_redo(
        &self,
        batch_id: &str,
        project_id: &str,
        row_index: i64,
        redo_column_ids: Vec<String>,
        cropped_image_ids: BTreeMap<String, String>,
        source_image_ids: Option<BTreeMap<String, String>>,
        priority: Option<i64>,
    ) -> Result<QueueJob> {
        if redo_column_ids.is_empty() {
            return Err(ManagerError::InvalidRedo("no columns requested".to_string()));
        }
        for column_id in &redo_column_ids {
            if !cropped_image_ids.contains_key(column_id) {
                return Err(ManagerError::InvalidRedo(format!(
                    "column {column_id} has no cropped image"
                )));
            }
        }
        self.checked_batch(batch_id, project_id).await?;

        let payload = RedoPayload {
            batch_id: batch_id.to_string(),
            row_index,
            redo_column_ids,
            cropped_image_ids,
            source_image_ids,
        };
        let payload = serde_json::to_string(&payload).map_err(DbError::from)?;
        let job = self
            .store
            .queue()
            .create_job(
                JobType::ProcessRedo,
                project_id,
                batch_id,
                &payload,
                priority.unwrap_or(DEFAULT_REDO_PRIORITY),
                DEFAULT_MAX_ATTEMPTS,
                Utc::now(),
            )
            .await?;
        Ok(job)
    }

    /// Cancel every non-terminal job of a project (optionally batch-scoped)
    /// and fail the affected batches still awaiting work. Idempotent.
    pub async fn cancel(
        &self,
        project_id: &str,
        batch_ids: Option<Vec<String>>,
    ) -> Result<CancelOutcome> {
        let now = Utc::now();
        let canceled_jobs = self
            .store
            .queue()
            .cancel_jobs(project_id, batch_ids.as_deref(), now)
            .await?;

        let batches = self.store.batches();
        let mut reset_batches = 0;
        for batch in batches.active_batches(project_id).await? {
            if let Some(ids) = &batch_ids {
                if !ids.contains(&batch.id) {
                    continue;
                }
            }
            batches
                .fail_batch(&batch.id, CANCELED_BY_USER_MESSAGE, now)
                .await?;
            reset_batches += 1;
        }

        info!(project_id, canceled_jobs, reset_batches, "Cancel applied");
        Ok(CancelOutcome {
            canceled_jobs,
            reset_batches,
        })
    }

    /// Move failed jobs back to `queued`; scope is one job or a project.
    pub async fn retry(&self, scope: RetryScope) -> Result<u64> {
        Ok(self.store.queue().retry_failed(&scope).await?)
    }

    pub async fn stats(&self, project_id: Option<&str>) -> Result<QueueStats> {
        Ok(self.store.queue().stats(project_id).await?)
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<QueueJob>> {
        Ok(self.store.queue().get_job(job_id).await?)
    }

    /// Apply a caller-facing status change (with its row-sync rules) to
    /// each batch that belongs to the project. Returns how many batches
    /// were updated; unknown and foreign batches are skipped.
    pub async fn set_batch_status(
        &self,
        batch_ids: &[String],
        target: BatchStatus,
        project_id: &str,
    ) -> Result<u64> {
        let batches = self.store.batches();
        let mut updated = 0;
        for batch_id in batch_ids {
            match self.checked_batch(batch_id, project_id).await {
                Ok(_) => {
                    batches.set_status(batch_id, target, Utc::now()).await?;
                    updated += 1;
                }
                Err(ManagerError::UnknownBatch(_) | ManagerError::ProjectMismatch { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(updated)
    }

    /// Delete batches (child rows and images first). Returns the count of
    /// batches removed.
    pub async fn delete_batches(&self, batch_ids: &[String], project_id: &str) -> Result<u64> {
        Ok(self
            .store
            .batches()
            .delete_batches(project_id, batch_ids)
            .await?)
    }

    async fn create_batch_job(
        &self,
        job_type: JobType,
        batch_id: &str,
        project_id: &str,
        priority: Option<i64>,
    ) -> Result<QueueJob> {
        let payload = ProcessBatchPayload {
            batch_id: batch_id.to_string(),
        };
        let payload = serde_json::to_string(&payload).map_err(DbError::from)?;
        let job = self
            .store
            .queue()
            .create_job(
                job_type,
                project_id,
                batch_id,
                &payload,
                priority.unwrap_or(DEFAULT_BATCH_PRIORITY),
                DEFAULT_MAX_ATTEMPTS,
                Utc::now(),
            )
            .await?;
        Ok(job)
    }

    async fn checked_batch(&self, batch_id: &str, project_id: &str) -> Result<BatchRecord> {
        let batch = self
            .store
            .batches()
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| ManagerError::UnknownBatch(batch_id.to_string()))?;
        if batch.project_id != project_id {
            return Err(ManagerError::ProjectMismatch {
                batch_id: batch_id.to_string(),
                project_id: project_id.to_string(),
            });
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docgrid_protocol::JobStatus;

    async fn manager_with_batch() -> (QueueManager, Store, String) {
        let store = Store::open_memory().await.unwrap();
        let batch = store.batches().create_batch("p1", Utc::now()).await.unwrap();
        (QueueManager::new(store.clone()), store, batch.id)
    }

    #[tokio::test]
    async fn test_enqueue_batch_validates_membership() {
        let (manager, _store, batch_id) = manager_with_batch().await;

        let job = manager.enqueue_batch(&batch_id, "p1", None).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, DEFAULT_BATCH_PRIORITY);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);

        assert!(matches!(
            manager.enqueue_batch(&batch_id, "other-project", None).await,
            Err(ManagerError::ProjectMismatch { .. })
        ));
        assert!(matches!(
            manager.enqueue_batch("ghost", "p1", None).await,
            Err(ManagerError::UnknownBatch(_))
        ));
    }

    #[tokio::test]
    async fn test_enqueue_is_additive_no_dedup() {
        let (manager, _store, batch_id) = manager_with_batch().await;
        manager.enqueue_batch(&batch_id, "p1", None).await.unwrap();
        manager.enqueue_batch(&batch_id, "p1", None).await.unwrap();

        let stats = manager.stats(Some("p1")).await.unwrap();
        assert_eq!(stats.queued, 2);
    }

    #[tokio::test]
    async fn test_enqueue_many_reports_first_failure() {
        let (manager, store, batch_id) = manager_with_batch().await;
        let second = store.batches().create_batch("p1", Utc::now()).await.unwrap();

        let batch_ids = vec![batch_id, "ghost".to_string(), second.id];
        let outcome = manager.enqueue_many(&batch_ids, "p1", None).await.unwrap();
        assert_eq!(outcome.job_ids.len(), 1);
        let (index, error) = outcome.failed.unwrap();
        assert_eq!(index, 1);
        assert!(error.contains("ghost"));

        // The job created before the failure is kept.
        let stats = manager.stats(Some("p1")).await.unwrap();
        assert_eq!(stats.queued, 1);
    }

    #[tokio::test]
    async fn test_redo_validation() {
        let (manager, _store, batch_id) = manager_with_batch().await;

        let err = manager
            .enqueue_redo(&batch_id, "p1", 0, vec![], BTreeMap::new(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::InvalidRedo(_)));

        let err = manager
            .enqueue_redo(
                &batch_id,
                "p1",
                0,
                vec!["total".to_string()],
                BTreeMap::new(),
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::InvalidRedo(_)));

        let mut crops = BTreeMap::new();
        crops.insert("total".to_string(), "img-1".to_string());
        let job = manager
            .enqueue_redo(
                &batch_id,
                "p1",
                0,
                vec!["total".to_string()],
                crops,
                None,
                None,
            )
            .await
            .unwrap();
        // Redo jobs are more urgent than full batches by default.
        assert!(job.priority < DEFAULT_BATCH_PRIORITY);
        assert_eq!(job.job_type, JobType::ProcessRedo);
    }

    #[tokio::test]
    async fn test_cancel_fails_pending_batches() {
        let (manager, store, batch_id) = manager_with_batch().await;
        manager.enqueue_batch(&batch_id, "p1", None).await.unwrap();

        let outcome = manager.cancel("p1", None).await.unwrap();
        assert_eq!(outcome.canceled_jobs, 1);
        assert_eq!(outcome.reset_batches, 1);

        let batch = store.batches().get_batch(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.error.as_deref(), Some(CANCELED_BY_USER_MESSAGE));

        // Idempotent: a second cancel touches nothing.
        let outcome = manager.cancel("p1", None).await.unwrap();
        assert_eq!(outcome, CancelOutcome::default());
    }

    #[tokio::test]
    async fn test_reprocess_resets_batch_and_enqueues() {
        let (manager, store, batch_id) = manager_with_batch().await;
        store
            .batches()
            .record_result(&batch_id, 2, "[]", Utc::now())
            .await
            .unwrap();

        let job = manager.reprocess_batch(&batch_id, "p1", None).await.unwrap();
        assert_eq!(job.job_type, JobType::ReprocessBatch);

        let batch = store.batches().get_batch(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Pending);
        assert!(batch.row_count.is_none());
    }

    #[tokio::test]
    async fn test_set_batch_status_skips_foreign_batches() {
        let (manager, store, batch_id) = manager_with_batch().await;
        let foreign = store.batches().create_batch("p2", Utc::now()).await.unwrap();

        let updated = manager
            .set_batch_status(
                &[batch_id.clone(), foreign.id.clone(), "ghost".to_string()],
                BatchStatus::Review,
                "p1",
            )
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let foreign = store.batches().get_batch(&foreign.id).await.unwrap().unwrap();
        assert_eq!(foreign.status, BatchStatus::Pending);
    }
}
