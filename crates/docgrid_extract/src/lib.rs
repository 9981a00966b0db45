//! Extraction pipelines for DocGrid.
//!
//! Everything between a leased job and its persisted rows: prompt assembly,
//! message building, the chat-completions call, wire-format parsing, row
//! grouping, and the redo merge-back. The engine crate owns scheduling and
//! throttling; this crate is handed a ready-to-use `VisionClient` and the
//! shared store.

pub mod error;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod redo;
pub mod rows;
pub mod sources;
pub mod wire;

pub use error::ExtractError;
pub use llm::{
    ChatCompletion, ChatMessage, ChatRequest, ContentPart, LlmError, MockVisionClient,
    OpenAiClient, VisionClient,
};
pub use pipeline::{ExtractionPipeline, PipelineReport};
pub use sources::{
    DbObjectStore, LoadedImage, ObjectStore, PageImage, PdfRasterizer, RasterizeError,
    RasterizeOptions,
};
pub use wire::{ParseError, RawExtraction, WireFormat};

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared fixtures for pipeline tests.

    use std::sync::Arc;

    use chrono::Utc;
    use docgrid_db::{NewImage, QueueJob, Store};
    use docgrid_protocol::{
        ColumnDefinition, ColumnType, CoordinateFormat, FeatureFlags, JobType, LlmSettings,
        ProcessBatchPayload, Project, RateLimitSettings,
    };

    use crate::llm::MockVisionClient;
    use crate::pipeline::ExtractionPipeline;

    pub struct TestContext {
        pub store: Store,
        pub client: Arc<MockVisionClient>,
        pub batch_id: String,
        /// A leased `process_batch` job for the seeded batch.
        pub job: QueueJob,
    }

    impl TestContext {
        pub fn pipeline(&self) -> ExtractionPipeline {
            ExtractionPipeline::new(self.store.clone(), self.client.clone())
        }
    }

    pub fn test_project(flags: FeatureFlags) -> Project {
        let column = |id: &str, name: &str, column_type| ColumnDefinition {
            id: id.to_string(),
            name: name.to_string(),
            column_type,
            description: None,
            allowed_values: None,
            validation_pattern: None,
        };
        Project {
            id: "p1".to_string(),
            owner_id: "u1".to_string(),
            name: "Statements".to_string(),
            columns: vec![
                column("date", "Date", ColumnType::Date),
                column("total", "Total", ColumnType::Currency),
                column("desc", "Description", ColumnType::Text),
            ],
            flags,
            llm: LlmSettings {
                endpoint_url: "https://llm.example/v1/chat/completions".to_string(),
                model: "vision-1".to_string(),
                api_key: "key".to_string(),
            },
            limits: RateLimitSettings::default(),
            request_timeout_secs: 60,
            coordinate_format: CoordinateFormat::default(),
        }
    }

    /// Store with one project, one batch of `images` pages (each with OCR
    /// text), and a leased job for it.
    pub async fn seed_with_flags(images: usize, flags: FeatureFlags) -> TestContext {
        let store = Store::open_memory().await.unwrap();
        let now = Utc::now();

        store
            .projects()
            .create_project(&test_project(flags), now)
            .await
            .unwrap();
        let batch = store.batches().create_batch("p1", now).await.unwrap();
        for position in 0..images {
            store
                .batches()
                .insert_image(
                    &NewImage::page(&batch.id, position as i64, vec![0x89, position as u8])
                        .with_ocr_text(format!("ocr page {}", position + 1)),
                )
                .await
                .unwrap();
        }

        let payload = ProcessBatchPayload {
            batch_id: batch.id.clone(),
        };
        store
            .queue()
            .create_job(
                JobType::ProcessBatch,
                "p1",
                &batch.id,
                &serde_json::to_string(&payload).unwrap(),
                10,
                3,
                now,
            )
            .await
            .unwrap();
        let job = store.queue().lease_next(now).await.unwrap().unwrap();

        TestContext {
            store,
            client: Arc::new(MockVisionClient::new()),
            batch_id: batch.id,
            job,
        }
    }

    pub async fn seed(images: usize) -> TestContext {
        seed_with_flags(images, FeatureFlags::default()).await
    }
}
