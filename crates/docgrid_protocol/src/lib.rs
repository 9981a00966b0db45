//! Canonical types for the DocGrid extraction engine.
//!
//! Everything the control plane (queue manager, worker) and the data plane
//! (extraction pipelines) agree on lives here: status enums, the project
//! schema model, job payloads, and system-wide defaults. This crate holds
//! plain data only; persistence and transport belong to the crates that
//! consume it.

pub mod config;
pub mod defaults;
pub mod types;

// Re-export the canonical enums and core structs for convenience
pub use types::{
    BatchStatus,
    ColumnDefinition,
    ColumnType,
    CoordinateFormat,
    ExtractionResult,
    FeatureFlags,
    JobStatus,
    JobType,
    LlmSettings,
    ProcessBatchPayload,
    Project,
    ProjectError,
    RateLimitSettings,
    RedoPayload,
    RowStatus,
    StatusParseError,
};
