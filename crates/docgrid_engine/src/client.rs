//! Pool-wrapped LLM client.
//!
//! The worker hands pipelines a `VisionClient` whose every call passes
//! through the project's admission pool, so the LLM request is the one and
//! only throttled step of a pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use docgrid_extract::{ChatCompletion, ChatRequest, LlmError, VisionClient};

use crate::metrics::METRICS;
use crate::pool::ProjectPool;

pub struct PooledClient {
    inner: Arc<dyn VisionClient>,
    pool: Arc<ProjectPool>,
}

impl PooledClient {
    pub fn new(inner: Arc<dyn VisionClient>, pool: Arc<ProjectPool>) -> Self {
        Self { inner, pool }
    }
}

#[async_trait]
impl VisionClient for PooledClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError> {
        let inner = self.inner.clone();
        self.pool
            .execute(|| async move {
                METRICS.inc_llm_calls();
                inner.complete(request).await
            })
            .await
    }
}
