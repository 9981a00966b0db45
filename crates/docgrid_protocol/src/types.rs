//! Domain types shared across all DocGrid crates.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when a persisted status string does not match any known variant.
#[derive(Debug, Error)]
#[error("unknown {kind} value: {value}")]
pub struct StatusParseError {
    pub kind: &'static str,
    pub value: String,
}

// ============================================================================
// Canonical Enums (used across all crates)
// ============================================================================

/// Kind of scheduled work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Full-batch extraction of an uploaded image batch.
    ProcessBatch,
    /// Re-extraction of a batch whose rows were cleared first.
    ReprocessBatch,
    /// Field-scoped re-extraction of one row using cropped images.
    ProcessRedo,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ProcessBatch => "process_batch",
            JobType::ReprocessBatch => "reprocess_batch",
            JobType::ProcessRedo => "process_redo",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process_batch" => Ok(JobType::ProcessBatch),
            "reprocess_batch" => Ok(JobType::ReprocessBatch),
            "process_redo" => Ok(JobType::ProcessRedo),
            other => Err(StatusParseError {
                kind: "job type",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for JobType {
    type Error = StatusParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Lifecycle of a queue job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Retrying,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Canceled => "canceled",
        }
    }

    /// Terminal states never transition again (except `failed` via retry).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// States that count as "active" for stale-batch reconciliation.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Processing | JobStatus::Retrying
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(StatusParseError {
                kind: "job status",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = StatusParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Lifecycle of an image batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Review,
    Approved,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Review => "review",
            BatchStatus::Approved => "approved",
            BatchStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "review" => Ok(BatchStatus::Review),
            "approved" => Ok(BatchStatus::Approved),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(StatusParseError {
                kind: "batch status",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for BatchStatus {
    type Error = StatusParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Lifecycle of an extraction row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Pending,
    Review,
    Approved,
    Deleted,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Pending => "pending",
            RowStatus::Review => "review",
            RowStatus::Approved => "approved",
            RowStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RowStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RowStatus::Pending),
            "review" => Ok(RowStatus::Review),
            "approved" => Ok(RowStatus::Approved),
            "deleted" => Ok(RowStatus::Deleted),
            other => Err(StatusParseError {
                kind: "row status",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for RowStatus {
    type Error = StatusParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Declared type of an extracted column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Number,
    Date,
    Currency,
    Boolean,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Number => "number",
            ColumnType::Date => "date",
            ColumnType::Currency => "currency",
            ColumnType::Boolean => "boolean",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire encoding of bounding-box tuples. Both variants use integers in
/// [0, 1000], x and y normalized independently of aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateFormat {
    /// `[x1, y1, x2, y2]`
    X1y1x2y2,
    /// `[y_min, x_min, y_max, x_max]`
    YminXminYmaxXmax,
}

impl CoordinateFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinateFormat::X1y1x2y2 => "x1y1x2y2",
            CoordinateFormat::YminXminYmaxXmax => "ymin_xmin_ymax_xmax",
        }
    }

    /// Human description of the tuple order, used verbatim in prompts.
    pub fn tuple_order(&self) -> &'static str {
        match self {
            CoordinateFormat::X1y1x2y2 => "[x1, y1, x2, y2]",
            CoordinateFormat::YminXminYmaxXmax => "[y_min, x_min, y_max, x_max]",
        }
    }
}

impl Default for CoordinateFormat {
    fn default() -> Self {
        CoordinateFormat::X1y1x2y2
    }
}

impl fmt::Display for CoordinateFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoordinateFormat {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x1y1x2y2" => Ok(CoordinateFormat::X1y1x2y2),
            "ymin_xmin_ymax_xmax" => Ok(CoordinateFormat::YminXminYmaxXmax),
            other => Err(StatusParseError {
                kind: "coordinate format",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for CoordinateFormat {
    type Error = StatusParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Project Schema
// ============================================================================

/// One user-defined column of the extraction schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Stable identifier within the project.
    pub id: String,
    /// Display name; the wire parser falls back to it when a result's
    /// `column_id` matches no schema id.
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_pattern: Option<String>,
}

/// Extraction feature toggles, all off by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub bounding_boxes: bool,
    #[serde(default)]
    pub confidence_scores: bool,
    #[serde(default)]
    pub multi_row_extraction: bool,
    #[serde(default)]
    pub toon_output: bool,
}

/// LLM endpoint settings for a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Full chat-completions URL, e.g. `https://host/v1/chat/completions`.
    pub endpoint_url: String,
    pub model: String,
    pub api_key: String,
}

/// Per-project throttle settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub requests_per_minute: u32,
    pub enable_parallel_requests: bool,
    /// Concurrency width when parallel mode is on.
    pub parallel_request_limit: u32,
}

impl RateLimitSettings {
    /// Effective concurrency cap. Serial unless parallel mode is enabled.
    pub fn max_concurrency(&self) -> u32 {
        if self.enable_parallel_requests {
            self.parallel_request_limit.max(1)
        } else {
            1
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: crate::defaults::DEFAULT_REQUESTS_PER_MINUTE,
            enable_parallel_requests: false,
            parallel_request_limit: crate::defaults::DEFAULT_PARALLEL_REQUEST_LIMIT,
        }
    }
}

/// Errors produced when decoding a stored project into its typed form.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("duplicate column id '{0}' in project schema")]
    DuplicateColumnId(String),
    #[error("project schema has no columns")]
    EmptySchema,
}

/// Fully decoded project configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    /// Ordered extraction schema.
    pub columns: Vec<ColumnDefinition>,
    pub flags: FeatureFlags,
    pub llm: LlmSettings,
    pub limits: RateLimitSettings,
    pub request_timeout_secs: u64,
    pub coordinate_format: CoordinateFormat,
}

impl Project {
    /// Column ids must be unique within a project.
    pub fn validate(&self) -> Result<(), ProjectError> {
        if self.columns.is_empty() {
            return Err(ProjectError::EmptySchema);
        }
        let mut seen = std::collections::HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.id.as_str()) {
                return Err(ProjectError::DuplicateColumnId(column.id.clone()));
            }
        }
        Ok(())
    }

    pub fn column_by_id(&self, id: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.id == id)
    }

    /// Case-sensitive exact match on the display name.
    pub fn column_by_name(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }
}

// ============================================================================
// Extraction Results
// ============================================================================

/// One extracted field, embedded in a row's `row_data`.
///
/// `row_index` here is denormalized for observability; the owning row's
/// index is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub column_id: String,
    pub column_name: String,
    pub value: Option<String>,
    pub image_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox_2d: Option<[i64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redone: Option<bool>,
}

// ============================================================================
// Job Payloads
// ============================================================================

/// Payload of `process_batch` and `reprocess_batch` jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessBatchPayload {
    pub batch_id: String,
}

/// Payload of `process_redo` jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedoPayload {
    pub batch_id: String,
    pub row_index: i64,
    /// Columns to re-extract; never empty.
    pub redo_column_ids: Vec<String>,
    /// column_id -> id of a previously uploaded cropped image.
    pub cropped_image_ids: BTreeMap<String, String>,
    /// column_id -> original image id, for coordinate remapping context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image_ids: Option<BTreeMap<String, String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Retrying,
            JobStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("QUEUED".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_type_serialization() {
        assert_eq!(
            serde_json::to_string(&JobType::ProcessRedo).unwrap(),
            "\"process_redo\""
        );
        assert_eq!(
            serde_json::from_str::<JobType>("\"reprocess_batch\"").unwrap(),
            JobType::ReprocessBatch
        );
    }

    #[test]
    fn test_max_concurrency_serial_by_default() {
        let limits = RateLimitSettings::default();
        assert_eq!(limits.max_concurrency(), 1);

        let parallel = RateLimitSettings {
            enable_parallel_requests: true,
            ..limits
        };
        assert!(parallel.max_concurrency() > 1);
    }

    #[test]
    fn test_project_validate_rejects_duplicate_ids() {
        let column = ColumnDefinition {
            id: "date".to_string(),
            name: "Date".to_string(),
            column_type: ColumnType::Date,
            description: None,
            allowed_values: None,
            validation_pattern: None,
        };
        let project = Project {
            id: "p1".to_string(),
            owner_id: "u1".to_string(),
            name: "Statements".to_string(),
            columns: vec![column.clone(), column],
            flags: FeatureFlags::default(),
            llm: LlmSettings {
                endpoint_url: "https://llm.example/v1/chat/completions".to_string(),
                model: "vision-1".to_string(),
                api_key: "key".to_string(),
            },
            limits: RateLimitSettings::default(),
            request_timeout_secs: 60,
            coordinate_format: CoordinateFormat::default(),
        };

        assert!(matches!(
            project.validate(),
            Err(ProjectError::DuplicateColumnId(_))
        ));
    }

    #[test]
    fn test_extraction_result_omits_absent_fields() {
        let result = ExtractionResult {
            column_id: "total".to_string(),
            column_name: "Total".to_string(),
            value: Some("42.00".to_string()),
            image_index: 0,
            bbox_2d: None,
            confidence: None,
            row_index: None,
            redone: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("bbox_2d"));
        assert!(!json.contains("redone"));
    }
}
