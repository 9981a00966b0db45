//! Redo pipeline: field-scoped re-extraction of one row.
//!
//! Uses caller-supplied cropped sub-images, one per redone column, and
//! merges the new values back into the existing row. Failure never changes
//! the row's status; the row stays reviewable and the user can retry.

use chrono::Utc;
use docgrid_db::QueueJob;
use tracing::info;

use crate::error::ExtractError;
use crate::llm::{ChatMessage, ChatRequest, ContentPart};
use crate::pipeline::{ExtractionPipeline, PipelineReport};
use crate::prompt;
use crate::rows::{group_rows, resolve_records};
use crate::wire::{self, WireFormat};

impl ExtractionPipeline {
    /// Re-extract `redo_column_ids` of one row from their crops and merge
    /// the results back, flagging each merged field `redone`.
    pub async fn process_redo(&self, job: &QueueJob) -> Result<PipelineReport, ExtractError> {
        let payload = job
            .redo_payload()
            .map_err(|e| ExtractError::InvalidBatch(format!("malformed redo payload: {e}")))?;
        if payload.redo_column_ids.is_empty() {
            return Err(ExtractError::InvalidBatch(
                "redo requested with no columns".to_string(),
            ));
        }

        let project = self.load_project(&job.project_id).await?;
        for column_id in &payload.redo_column_ids {
            if project.column_by_id(column_id).is_none() {
                return Err(ExtractError::InvalidBatch(format!(
                    "redo column {column_id} is not in the project schema"
                )));
            }
        }

        let batches = self.store.batches();
        let row = batches
            .get_row(&payload.batch_id, payload.row_index)
            .await?
            .ok_or_else(|| {
                ExtractError::InvalidBatch(format!(
                    "row {} of batch {} not found",
                    payload.row_index, payload.batch_id
                ))
            })?;
        let context = row.results()?;

        // One crop per redone column, in redo-column order.
        let mut crops = Vec::with_capacity(payload.redo_column_ids.len());
        for column_id in &payload.redo_column_ids {
            let image_id = payload.cropped_image_ids.get(column_id).ok_or_else(|| {
                ExtractError::InvalidBatch(format!("no cropped image for column {column_id}"))
            })?;
            crops.push(self.objects.load_image(image_id).await?);
        }

        info!(
            job_id = %job.id,
            batch_id = %payload.batch_id,
            row_index = payload.row_index,
            columns = payload.redo_column_ids.len(),
            "Redoing row fields"
        );

        let mut parts: Vec<ContentPart> = crops
            .iter()
            .map(|crop| ContentPart::image(&crop.bytes, &crop.mime_type))
            .collect();
        parts.push(ContentPart::text(prompt::build_redo_prompt(
            &project,
            &context,
            &payload.redo_column_ids,
        )));

        let request = ChatRequest {
            model: project.llm.model.clone(),
            messages: vec![ChatMessage::user(parts)],
            max_tokens: None,
        };
        let completion = self.client.complete(&request).await?;

        let format = WireFormat::for_flags(project.flags.toon_output);
        let raw = wire::parse(&completion.content, format)?;
        // A redo targets exactly one row; collapse whatever row indices the
        // model emitted and keep only the requested columns.
        let resolved = resolve_records(&project, raw, false);
        let updates: Vec<_> = group_rows(resolved)
            .into_iter()
            .next()
            .unwrap_or_default()
            .into_iter()
            .filter(|result| payload.redo_column_ids.contains(&result.column_id))
            .collect();

        self.ensure_not_canceled(&job.id).await?;

        let merged = batches
            .merge_row_fields(&payload.batch_id, payload.row_index, &updates)
            .await?;
        info!(job_id = %job.id, merged, "Redo merged");

        Ok(PipelineReport {
            row_count: 1,
            extraction_count: merged as i64,
            image_count: crops.len() as i64,
            model: completion.model,
            tokens_used: completion.tokens_used,
        })
    }
}
