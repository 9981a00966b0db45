//! Full-batch extraction pipeline.
//!
//! One job in, one dense row set out: load the project and images, assemble
//! the prompt and message, call the endpoint, parse and group the response,
//! and persist through the store. The client handed in by the engine is
//! already wrapped by the per-project pool, so the LLM call is the only
//! throttled step.

use std::sync::Arc;

use chrono::Utc;
use docgrid_db::{QueueJob, Store};
use docgrid_protocol::{JobStatus, JobType, Project};
use tracing::info;

use crate::error::ExtractError;
use crate::llm::{ChatMessage, ChatRequest, ContentPart, VisionClient};
use crate::prompt;
use crate::rows::{group_rows, resolve_records};
use crate::sources::{DbObjectStore, ObjectStore};
use crate::wire::{self, WireFormat};

/// What a successful pipeline run produced; the worker turns this into a
/// processing metric.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub row_count: usize,
    pub extraction_count: i64,
    pub image_count: i64,
    pub model: String,
    pub tokens_used: Option<i64>,
}

pub struct ExtractionPipeline {
    pub(crate) store: Store,
    pub(crate) client: Arc<dyn VisionClient>,
    pub(crate) objects: Arc<dyn ObjectStore>,
}

impl ExtractionPipeline {
    pub fn new(store: Store, client: Arc<dyn VisionClient>) -> Self {
        let objects = Arc::new(DbObjectStore::new(store.clone()));
        Self {
            store,
            client,
            objects,
        }
    }

    pub fn with_object_store(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = objects;
        self
    }

    /// Execute a job of any type.
    pub async fn run(&self, job: &QueueJob) -> Result<PipelineReport, ExtractError> {
        match job.job_type {
            // Reprocess differs from a fresh extraction only in intent; the
            // batch was reset to pending when the job was enqueued.
            JobType::ProcessBatch | JobType::ReprocessBatch => self.process_batch(job).await,
            JobType::ProcessRedo => self.process_redo(job).await,
        }
    }

    /// Full-batch extraction with batch-status bookkeeping on failure.
    pub async fn process_batch(&self, job: &QueueJob) -> Result<PipelineReport, ExtractError> {
        let result = self.run_batch(job).await;
        if let Err(error) = &result {
            if error.fails_batch() {
                // Best effort: the job failure stands even if this write fails.
                let _ = self
                    .store
                    .batches()
                    .fail_batch(&job.batch_id, &short_message(error), Utc::now())
                    .await;
            }
        }
        result
    }

    async fn run_batch(&self, job: &QueueJob) -> Result<PipelineReport, ExtractError> {
        let payload = job
            .batch_payload()
            .map_err(|e| ExtractError::InvalidBatch(format!("malformed job payload: {e}")))?;
        let project = self.load_project(&job.project_id).await?;

        let batches = self.store.batches();
        let batch = batches
            .get_batch(&payload.batch_id)
            .await?
            .ok_or_else(|| {
                ExtractError::InvalidBatch(format!("batch {} not found", payload.batch_id))
            })?;
        if batch.project_id != job.project_id {
            return Err(ExtractError::InvalidBatch(format!(
                "batch {} does not belong to project {}",
                batch.id, job.project_id
            )));
        }

        let images = batches.primary_images(&batch.id).await?;
        if images.is_empty() {
            return Err(ExtractError::InvalidBatch(format!(
                "batch {} has no images",
                batch.id
            )));
        }

        batches.mark_processing(&batch.id, Utc::now()).await?;
        info!(job_id = %job.id, batch_id = %batch.id, images = images.len(), "Extracting batch");

        // Interleave each page with its OCR reference, prompt last.
        let mut parts = Vec::with_capacity(images.len() * 2 + 1);
        for (page, image) in images.iter().enumerate() {
            parts.push(ContentPart::image(&image.content, &image.mime_type));
            if !image.ocr_text.is_empty() {
                parts.push(ContentPart::text(format!(
                    "[OCR reference - page {}]:\n{}",
                    page + 1,
                    image.ocr_text
                )));
            }
        }
        parts.push(ContentPart::text(prompt::build_extraction_prompt(&project)));

        let request = ChatRequest {
            model: project.llm.model.clone(),
            messages: vec![ChatMessage::user(parts)],
            max_tokens: None,
        };
        let completion = self.client.complete(&request).await?;

        let format = WireFormat::for_flags(project.flags.toon_output);
        let raw = wire::parse(&completion.content, format)?;
        let resolved = resolve_records(&project, raw, project.flags.multi_row_extraction);
        let rows = group_rows(resolved);

        self.ensure_not_canceled(&job.id).await?;

        let mirror = serde_json::to_string(&rows).map_err(docgrid_db::DbError::from)?;
        batches
            .persist_rows(&batch.id, &job.project_id, &rows, Utc::now())
            .await?;
        batches
            .record_result(&batch.id, rows.len() as i64, &mirror, Utc::now())
            .await?;

        let extraction_count = rows.iter().map(|row| row.len() as i64).sum();
        info!(job_id = %job.id, batch_id = %batch.id, rows = rows.len(), extraction_count, "Batch extracted");
        Ok(PipelineReport {
            row_count: rows.len(),
            extraction_count,
            image_count: images.len() as i64,
            model: completion.model,
            tokens_used: completion.tokens_used,
        })
    }

    pub(crate) async fn load_project(&self, project_id: &str) -> Result<Project, ExtractError> {
        match self.store.projects().get_project(project_id).await {
            Ok(project) => Ok(project),
            Err(docgrid_db::DbError::NotFound(_)) => Err(ExtractError::InvalidBatch(format!(
                "project {project_id} not found"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// A job canceled mid-flight has its write discarded, not persisted.
    pub(crate) async fn ensure_not_canceled(&self, job_id: &str) -> Result<(), ExtractError> {
        match self.store.queue().get_job(job_id).await? {
            Some(job) if job.status != JobStatus::Canceled => Ok(()),
            _ => Err(ExtractError::Canceled),
        }
    }
}

/// Short, human-oriented error for the batch record.
pub(crate) fn short_message(error: &ExtractError) -> String {
    let mut message = error.to_string();
    if message.len() > 500 {
        message.truncate(500);
        message.push('…');
    }
    message
}
