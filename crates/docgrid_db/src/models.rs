//! Database models for the DocGrid store.
//!
//! Uses derive macros for FromRow to map database rows to structs. Status
//! columns are stored as text and decoded through the canonical enums in
//! `docgrid_protocol`.

use chrono::{DateTime, Utc};
use docgrid_protocol::{
    BatchStatus, CoordinateFormat, ExtractionResult, JobStatus, JobType, ProcessBatchPayload,
    Project, RedoPayload, RowStatus, StatusParseError,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use crate::error::{DbError, Result};

// ============================================================================
// Queue
// ============================================================================

/// One unit of scheduled work.
#[derive(Debug, Clone, FromRow)]
pub struct QueueJob {
    pub id: String,
    #[sqlx(try_from = "String")]
    pub job_type: JobType,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub priority: i64,
    pub project_id: String,
    pub batch_id: String,
    /// Type-specific payload, JSON.
    pub payload: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
}

impl QueueJob {
    /// Decode the payload of a batch-processing job.
    pub fn batch_payload(&self) -> Result<ProcessBatchPayload> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    /// Decode the payload of a redo job.
    pub fn redo_payload(&self) -> Result<RedoPayload> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

// ============================================================================
// Batches and Images
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct BatchRecord {
    pub id: String,
    pub project_id: String,
    #[sqlx(try_from = "String")]
    pub status: BatchStatus,
    /// Populated post-extraction.
    pub row_count: Option<i64>,
    /// Denormalized mirror of the produced extractions, JSON.
    pub processed_data: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ImageRecord {
    pub id: String,
    pub batch_id: String,
    pub position: i64,
    pub content: Vec<u8>,
    pub mime_type: String,
    /// Rendered OCR text; may be empty.
    pub ocr_text: String,
    pub parent_image_id: Option<String>,
    pub column_id: Option<String>,
    /// Bounding box the crop was taken from, JSON tuple.
    pub bbox_used: Option<String>,
    pub is_cropped: bool,
}

/// Insert form for an image; the store assigns the id.
#[derive(Debug, Clone, Default)]
pub struct NewImage {
    pub batch_id: String,
    pub position: i64,
    pub content: Vec<u8>,
    pub mime_type: String,
    pub ocr_text: String,
    pub parent_image_id: Option<String>,
    pub column_id: Option<String>,
    pub bbox_used: Option<String>,
    pub is_cropped: bool,
}

impl NewImage {
    /// A plain page image at the given position.
    pub fn page(batch_id: impl Into<String>, position: i64, content: Vec<u8>) -> Self {
        Self {
            batch_id: batch_id.into(),
            position,
            content,
            mime_type: "image/png".to_string(),
            ..Self::default()
        }
    }

    pub fn with_ocr_text(mut self, ocr_text: impl Into<String>) -> Self {
        self.ocr_text = ocr_text.into();
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// A crop of `parent_image_id` covering one column.
    pub fn crop(
        batch_id: impl Into<String>,
        parent_image_id: impl Into<String>,
        column_id: impl Into<String>,
        bbox_used: Option<String>,
        content: Vec<u8>,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            position: 0,
            content,
            mime_type: "image/png".to_string(),
            parent_image_id: Some(parent_image_id.into()),
            column_id: Some(column_id.into()),
            bbox_used,
            is_cropped: true,
            ..Self::default()
        }
    }
}

// ============================================================================
// Extraction Rows
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct RowRecord {
    pub id: String,
    pub batch_id: String,
    pub project_id: String,
    pub row_index: i64,
    /// JSON list of `ExtractionResult`.
    pub row_data: String,
    #[sqlx(try_from = "String")]
    pub status: RowStatus,
    pub approved_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RowRecord {
    /// Decode `row_data` into typed extraction results.
    pub fn results(&self) -> Result<Vec<ExtractionResult>> {
        Ok(serde_json::from_str(&self.row_data)?)
    }
}

// ============================================================================
// Projects
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct ProjectRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub columns_json: String,
    pub bounding_boxes: bool,
    pub confidence_scores: bool,
    pub multi_row_extraction: bool,
    pub toon_output: bool,
    pub endpoint_url: String,
    pub model: String,
    pub api_key: String,
    pub requests_per_minute: i64,
    pub enable_parallel_requests: bool,
    pub parallel_request_limit: i64,
    pub request_timeout_secs: i64,
    #[sqlx(try_from = "String")]
    pub coordinate_format: CoordinateFormat,
    pub created_at: DateTime<Utc>,
}

impl ProjectRecord {
    /// Decode into the typed project, enforcing schema invariants.
    pub fn into_project(self) -> Result<Project> {
        let columns = serde_json::from_str(&self.columns_json)?;
        let project = Project {
            id: self.id,
            owner_id: self.owner_id,
            name: self.name,
            columns,
            flags: docgrid_protocol::FeatureFlags {
                bounding_boxes: self.bounding_boxes,
                confidence_scores: self.confidence_scores,
                multi_row_extraction: self.multi_row_extraction,
                toon_output: self.toon_output,
            },
            llm: docgrid_protocol::LlmSettings {
                endpoint_url: self.endpoint_url,
                model: self.model,
                api_key: self.api_key,
            },
            limits: docgrid_protocol::RateLimitSettings {
                requests_per_minute: self.requests_per_minute.max(1) as u32,
                enable_parallel_requests: self.enable_parallel_requests,
                parallel_request_limit: self.parallel_request_limit.max(1) as u32,
            },
            request_timeout_secs: self.request_timeout_secs.max(1) as u64,
            coordinate_format: self.coordinate_format,
        };
        project
            .validate()
            .map_err(|e| DbError::constraint(e.to_string()))?;
        Ok(project)
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Outcome tag of a processing metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    Success,
    Failed,
}

impl MetricStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricStatus::Success => "success",
            MetricStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MetricStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(MetricStatus::Success),
            "failed" => Ok(MetricStatus::Failed),
            other => Err(StatusParseError {
                kind: "metric status",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for MetricStatus {
    type Error = StatusParseError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// One record per terminal job outcome.
#[derive(Debug, Clone, FromRow)]
pub struct MetricRecord {
    pub id: String,
    #[sqlx(try_from = "String")]
    pub job_type: JobType,
    #[sqlx(try_from = "String")]
    pub status: MetricStatus,
    pub duration_ms: i64,
    pub image_count: i64,
    pub extraction_count: i64,
    pub model: String,
    pub tokens_used: Option<i64>,
    pub batch_id: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
}

/// Insert form for a processing metric.
#[derive(Debug, Clone)]
pub struct NewMetric {
    pub job_type: JobType,
    pub status: MetricStatus,
    pub duration_ms: i64,
    pub image_count: i64,
    pub extraction_count: i64,
    pub model: String,
    pub tokens_used: Option<i64>,
    pub batch_id: String,
    pub project_id: String,
}
