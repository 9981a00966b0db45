//! Batch, image, and extraction-row store.
//!
//! Row identity is `(batch_id, row_index)`; `persist_rows` replaces the full
//! dense row set for a batch, and `merge_row_fields` performs the
//! field-scoped overwrite used by redo jobs.

use chrono::{DateTime, Utc};
use docgrid_protocol::{BatchStatus, ExtractionResult};
use sqlx::{Pool, QueryBuilder, Sqlite};
use tracing::info;
use uuid::Uuid;

use crate::error::{DbError, Result};
use crate::models::{BatchRecord, ImageRecord, NewImage, RowRecord};

#[derive(Clone)]
pub struct BatchStore {
    pool: Pool<Sqlite>,
}

impl BatchStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    // ========================================================================
    // Batch and image CRUD (consumed by the upload collaborator and tests)
    // ========================================================================

    pub async fn create_batch(&self, project_id: &str, now: DateTime<Utc>) -> Result<BatchRecord> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO image_batches (id, project_id, status, created_at, updated_at)
            VALUES (?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(project_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_batch(&id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("batch {id}")))
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchRecord>> {
        let batch = sqlx::query_as("SELECT * FROM image_batches WHERE id = ?")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(batch)
    }

    pub async fn insert_image(&self, image: &NewImage) -> Result<ImageRecord> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO images
                (id, batch_id, position, content, mime_type, ocr_text,
                 parent_image_id, column_id, bbox_used, is_cropped)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&image.batch_id)
        .bind(image.position)
        .bind(&image.content)
        .bind(&image.mime_type)
        .bind(&image.ocr_text)
        .bind(&image.parent_image_id)
        .bind(&image.column_id)
        .bind(&image.bbox_used)
        .bind(image.is_cropped)
        .execute(&self.pool)
        .await?;

        let record = sqlx::query_as("SELECT * FROM images WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        Ok(record)
    }

    /// Ordered page images of a batch (crops excluded).
    pub async fn primary_images(&self, batch_id: &str) -> Result<Vec<ImageRecord>> {
        let images = sqlx::query_as(
            r#"
            SELECT * FROM images
            WHERE batch_id = ? AND is_cropped = 0
            ORDER BY position ASC
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(images)
    }

    /// Batches of a project still in `pending` or `processing`.
    pub async fn active_batches(&self, project_id: &str) -> Result<Vec<BatchRecord>> {
        let batches = sqlx::query_as(
            r#"
            SELECT * FROM image_batches
            WHERE project_id = ? AND status IN ('pending', 'processing')
            ORDER BY created_at ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(batches)
    }

    pub async fn get_image(&self, image_id: &str) -> Result<Option<ImageRecord>> {
        let image = sqlx::query_as("SELECT * FROM images WHERE id = ?")
            .bind(image_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(image)
    }

    // ========================================================================
    // Batch status transitions
    // ========================================================================

    pub async fn mark_processing(&self, batch_id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE image_batches
            SET status = 'processing', error = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Successful extraction: stamp the row count and the denormalized
    /// mirror, and put the batch up for review.
    pub async fn record_result(
        &self,
        batch_id: &str,
        row_count: i64,
        processed_data: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE image_batches
            SET status = 'review',
                row_count = ?,
                processed_data = ?,
                error = NULL,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(row_count)
        .bind(processed_data)
        .bind(now)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_batch(&self, batch_id: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE image_batches
            SET status = 'failed', error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Caller-facing status change with row synchronization:
    ///
    /// - `approved`: child rows in `review` become `approved`.
    /// - `failed`: with no approved children, `review` rows become `deleted`.
    /// - `pending`: child rows are hard-deleted, `row_count` and
    ///   `processed_data` cleared (reprocess intent).
    /// - `review`: status only.
    pub async fn set_status(
        &self,
        batch_id: &str,
        target: BatchStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if target == BatchStatus::Processing {
            return Err(DbError::invalid_state(
                "batches enter 'processing' only through a worker lease",
            ));
        }

        let mut tx = self.pool.begin().await?;

        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM image_batches WHERE id = ?")
            .bind(batch_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(DbError::not_found(format!("batch {batch_id}")));
        }

        match target {
            BatchStatus::Approved => {
                sqlx::query(
                    r#"
                    UPDATE extraction_rows
                    SET status = 'approved', approved_at = ?
                    WHERE batch_id = ? AND status = 'review'
                    "#,
                )
                .bind(now)
                .bind(batch_id)
                .execute(&mut *tx)
                .await?;
                sqlx::query("UPDATE image_batches SET status = 'approved', updated_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(batch_id)
                    .execute(&mut *tx)
                    .await?;
            }
            BatchStatus::Failed => {
                let approved: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM extraction_rows WHERE batch_id = ? AND status = 'approved'",
                )
                .bind(batch_id)
                .fetch_one(&mut *tx)
                .await?;
                if approved == 0 {
                    sqlx::query(
                        r#"
                        UPDATE extraction_rows
                        SET status = 'deleted', deleted_at = ?
                        WHERE batch_id = ? AND status = 'review'
                        "#,
                    )
                    .bind(now)
                    .bind(batch_id)
                    .execute(&mut *tx)
                    .await?;
                }
                // Keep row_count equal to the non-deleted row set.
                sqlx::query(
                    r#"
                    UPDATE image_batches
                    SET status = 'failed',
                        updated_at = ?,
                        row_count = CASE WHEN row_count IS NULL THEN NULL ELSE (
                            SELECT COUNT(*) FROM extraction_rows
                            WHERE batch_id = image_batches.id AND status != 'deleted'
                        ) END
                    WHERE id = ?
                    "#,
                )
                .bind(now)
                .bind(batch_id)
                .execute(&mut *tx)
                .await?;
            }
            BatchStatus::Pending => {
                sqlx::query("DELETE FROM extraction_rows WHERE batch_id = ?")
                    .bind(batch_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(
                    r#"
                    UPDATE image_batches
                    SET status = 'pending', row_count = NULL, processed_data = NULL,
                        error = NULL, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(now)
                .bind(batch_id)
                .execute(&mut *tx)
                .await?;
            }
            BatchStatus::Review => {
                sqlx::query("UPDATE image_batches SET status = 'review', updated_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(batch_id)
                    .execute(&mut *tx)
                    .await?;
            }
            BatchStatus::Processing => unreachable!("rejected above"),
        }

        tx.commit().await?;
        Ok(())
    }

    /// Crash-recovery primitive: every `processing` batch without an active
    /// job goes back to `pending` with its error cleared.
    pub async fn reset_stale_batches(&self, now: DateTime<Utc>) -> Result<u64> {
        let reset = sqlx::query(
            r#"
            UPDATE image_batches
            SET status = 'pending', error = NULL, updated_at = ?
            WHERE status = 'processing'
              AND id NOT IN (
                  SELECT batch_id FROM queue_jobs
                  WHERE status IN ('queued', 'processing', 'retrying')
              )
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if reset > 0 {
            info!(reset, "Reset stale processing batches to pending");
        }
        Ok(reset)
    }

    // ========================================================================
    // Extraction rows
    // ========================================================================

    /// Replace the full row set of a batch. Row identity is
    /// `(batch_id, row_index)`; indices beyond the new set are removed, so a
    /// reprocessed batch never keeps orphaned rows.
    pub async fn persist_rows(
        &self,
        batch_id: &str,
        project_id: &str,
        rows: &[Vec<ExtractionResult>],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for (row_index, row_data) in rows.iter().enumerate() {
            let encoded = serde_json::to_string(row_data)?;
            sqlx::query(
                r#"
                INSERT INTO extraction_rows
                    (id, batch_id, project_id, row_index, row_data, status, created_at)
                VALUES (?, ?, ?, ?, ?, 'review', ?)
                ON CONFLICT (batch_id, row_index) DO UPDATE SET
                    row_data = excluded.row_data,
                    project_id = excluded.project_id,
                    status = 'review',
                    approved_at = NULL,
                    deleted_at = NULL
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(batch_id)
            .bind(project_id)
            .bind(row_index as i64)
            .bind(encoded)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM extraction_rows WHERE batch_id = ? AND row_index >= ?")
            .bind(batch_id)
            .bind(rows.len() as i64)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Field-scoped overwrite within one row: each updated extraction
    /// replaces the record matching on `column_id` (or `column_name` as a
    /// fallback) and is flagged `redone`; everything else is preserved and
    /// no new columns are ever created. Returns the number of fields merged.
    pub async fn merge_row_fields(
        &self,
        batch_id: &str,
        row_index: i64,
        updated: &[ExtractionResult],
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        let row: Option<RowRecord> = sqlx::query_as(
            "SELECT * FROM extraction_rows WHERE batch_id = ? AND row_index = ?",
        )
        .bind(batch_id)
        .bind(row_index)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(DbError::not_found(format!(
                "row {row_index} of batch {batch_id}"
            )));
        };

        let mut results: Vec<ExtractionResult> = serde_json::from_str(&row.row_data)?;
        let mut merged = 0usize;
        for update in updated {
            let slot_idx = results
                .iter()
                .position(|r| r.column_id == update.column_id)
                .or_else(|| {
                    results
                        .iter()
                        .position(|r| r.column_name == update.column_name)
                });
            if let Some(existing) = slot_idx.map(|i| &mut results[i]) {
                existing.value = update.value.clone();
                existing.image_index = update.image_index;
                existing.bbox_2d = update.bbox_2d;
                existing.confidence = update.confidence;
                existing.redone = Some(true);
                merged += 1;
            }
        }

        if merged > 0 {
            let encoded = serde_json::to_string(&results)?;
            sqlx::query("UPDATE extraction_rows SET row_data = ? WHERE id = ?")
                .bind(encoded)
                .bind(&row.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(merged)
    }

    /// All rows of a batch ordered by index, deleted ones included.
    pub async fn rows_for_batch(&self, batch_id: &str) -> Result<Vec<RowRecord>> {
        let rows = sqlx::query_as(
            "SELECT * FROM extraction_rows WHERE batch_id = ? ORDER BY row_index ASC",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_row(&self, batch_id: &str, row_index: i64) -> Result<Option<RowRecord>> {
        let row = sqlx::query_as(
            "SELECT * FROM extraction_rows WHERE batch_id = ? AND row_index = ?",
        )
        .bind(batch_id)
        .bind(row_index)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Delete batches with their child rows and images. Returns the number
    /// of batches removed.
    pub async fn delete_batches(&self, project_id: &str, batch_ids: &[String]) -> Result<u64> {
        if batch_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;

        for table in ["extraction_rows", "images"] {
            let mut qb = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {table} WHERE batch_id IN ("));
            let mut separated = qb.separated(", ");
            for id in batch_ids {
                separated.push_bind(id);
            }
            qb.push(")");
            qb.build().execute(&mut *tx).await?;
        }

        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM image_batches WHERE project_id = ");
        qb.push_bind(project_id);
        qb.push(" AND id IN (");
        let mut separated = qb.separated(", ");
        for id in batch_ids {
            separated.push_bind(id);
        }
        qb.push(")");
        let deleted = qb.build().execute(&mut *tx).await?.rows_affected();

        tx.commit().await?;
        if deleted > 0 {
            info!(project_id, deleted, "Deleted batches");
        }
        Ok(deleted)
    }
}
