//! Schema bootstrap for the DocGrid store.
//!
//! Statements are idempotent (`IF NOT EXISTS`) and applied in order on every
//! startup, so a fresh file and an existing database converge to the same
//! layout.

use sqlx::{Pool, Sqlite};

use crate::error::Result;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        name TEXT NOT NULL,
        columns_json TEXT NOT NULL,
        bounding_boxes INTEGER NOT NULL DEFAULT 0,
        confidence_scores INTEGER NOT NULL DEFAULT 0,
        multi_row_extraction INTEGER NOT NULL DEFAULT 0,
        toon_output INTEGER NOT NULL DEFAULT 0,
        endpoint_url TEXT NOT NULL,
        model TEXT NOT NULL,
        api_key TEXT NOT NULL,
        requests_per_minute INTEGER NOT NULL,
        enable_parallel_requests INTEGER NOT NULL DEFAULT 0,
        parallel_request_limit INTEGER NOT NULL,
        request_timeout_secs INTEGER NOT NULL,
        coordinate_format TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS image_batches (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        row_count INTEGER,
        processed_data TEXT,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS images (
        id TEXT PRIMARY KEY,
        batch_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        content BLOB NOT NULL,
        mime_type TEXT NOT NULL DEFAULT 'image/png',
        ocr_text TEXT NOT NULL DEFAULT '',
        parent_image_id TEXT,
        column_id TEXT,
        bbox_used TEXT,
        is_cropped INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS extraction_rows (
        id TEXT PRIMARY KEY,
        batch_id TEXT NOT NULL,
        project_id TEXT NOT NULL,
        row_index INTEGER NOT NULL,
        row_data TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'review',
        approved_at TEXT,
        deleted_at TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_extraction_rows_batch_index
        ON extraction_rows (batch_id, row_index)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_jobs (
        id TEXT PRIMARY KEY,
        job_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        priority INTEGER NOT NULL,
        project_id TEXT NOT NULL,
        batch_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        error TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        retry_at TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_queue_jobs_lease
        ON queue_jobs (status, priority, created_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_queue_jobs_batch
        ON queue_jobs (batch_id, status)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS processing_metrics (
        id TEXT PRIMARY KEY,
        job_type TEXT NOT NULL,
        status TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        image_count INTEGER NOT NULL,
        extraction_count INTEGER NOT NULL,
        model TEXT NOT NULL,
        tokens_used INTEGER,
        batch_id TEXT NOT NULL,
        project_id TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
];

/// Apply the schema to a freshly opened pool.
pub async fn ensure_schema(pool: &Pool<Sqlite>) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
