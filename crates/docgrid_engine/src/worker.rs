//! Worker runtime.
//!
//! A single-instance-per-process loop: reconcile stale state once, then
//! lease-and-dispatch until told to stop. Each leased job runs as its own
//! task; the per-project pool inside the pooled client bounds LLM
//! concurrency, so the loop itself never blocks on a saturated project.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use docgrid_db::{DbError, FailOutcome, MetricStatus, NewMetric, QueueJob, Store};
use docgrid_extract::{ExtractError, ExtractionPipeline, OpenAiClient, PipelineReport, VisionClient};
use docgrid_protocol::config::SystemConfig;
use docgrid_protocol::Project;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::metrics::METRICS;
use crate::client::PooledClient;
use crate::pool::ProjectPools;

/// Worker tuning, derived from `SystemConfig`.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let system = SystemConfig::default();
        Self {
            poll_interval: system.poll_interval,
            retry_backoff: system.retry_backoff,
            drain_timeout: system.drain_timeout,
        }
    }
}

impl From<&SystemConfig> for WorkerConfig {
    fn from(config: &SystemConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            retry_backoff: config.retry_backoff,
            drain_timeout: config.drain_timeout,
        }
    }
}

/// Builds the LLM client for a project. The default speaks the project's
/// OpenAI-compatible endpoint; tests inject mocks here.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, project: &Project) -> Arc<dyn VisionClient>;
}

struct OpenAiFactory;

impl ClientFactory for OpenAiFactory {
    fn client_for(&self, project: &Project) -> Arc<dyn VisionClient> {
        Arc::new(OpenAiClient::for_project(project))
    }
}

pub struct Worker {
    store: Store,
    pools: Arc<ProjectPools>,
    factory: Arc<dyn ClientFactory>,
    config: WorkerConfig,
}

/// Controls a started worker. `shutdown` drains in-flight pipelines within
/// the configured timeout; anything still running is reclaimed as stale on
/// the next startup.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Worker task ended abnormally: {e}");
        }
    }
}

impl Worker {
    pub fn new(store: Store, config: WorkerConfig) -> Self {
        Self {
            store,
            pools: ProjectPools::new(),
            factory: Arc::new(OpenAiFactory),
            config,
        }
    }

    pub fn with_client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Run startup reconciliation, then spawn the lease loop.
    pub async fn start(self) -> Result<WorkerHandle, DbError> {
        let sweep = self.store.reset_stale(Utc::now()).await?;
        info!(
            canceled_jobs = sweep.canceled_jobs,
            reset_batches = sweep.reset_batches,
            "Startup reconciliation complete"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            task,
        })
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Worker entering lease loop");
        let mut pipelines: JoinSet<()> = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Utc::now();
            if let Err(e) = self.store.queue().release_due_retries(now).await {
                error!("Failed to release due retries: {e}");
            }

            match self.store.queue().lease_next(now).await {
                Ok(Some(job)) => {
                    METRICS.inc_jobs_leased();
                    self.dispatch(job, &mut pipelines).await;
                    // Keep leasing until the queue is drained for this tick.
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!("Lease failed: {e}"),
            }

            // Reap finished pipelines without blocking the loop.
            while let Some(result) = pipelines.try_join_next() {
                if let Err(e) = result {
                    error!("Pipeline task panicked: {e}");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Worker draining {} in-flight pipeline(s)", pipelines.len());
        let drain = async {
            while let Some(result) = pipelines.join_next().await {
                if let Err(e) = result {
                    error!("Pipeline task panicked: {e}");
                }
            }
        };
        if tokio::time::timeout(self.config.drain_timeout, drain)
            .await
            .is_err()
        {
            warn!("Drain timeout elapsed; in-flight jobs will be reclaimed at next startup");
        }
        info!("Worker stopped");
    }

    /// Resolve the job's project and client, then spawn its pipeline. A
    /// failure to start is recorded through the store - never a silent drop.
    async fn dispatch(&self, job: QueueJob, pipelines: &mut JoinSet<()>) {
        match self.prepare(&job).await {
            Ok((pipeline, model)) => {
                let store = self.store.clone();
                let backoff = self.config.retry_backoff;
                pipelines.spawn(async move {
                    execute_job(store, pipeline, job, model, backoff).await;
                });
            }
            Err(error) => {
                error!(job_id = %job.id, "Failed to start pipeline: {error}");
                let outcome = self
                    .store
                    .queue()
                    .fail_job(
                        &job.id,
                        &error.to_string(),
                        error.is_retriable(),
                        self.config.retry_backoff,
                        Utc::now(),
                    )
                    .await;
                match outcome {
                    Ok(FailOutcome::RetryScheduled { .. }) => METRICS.inc_jobs_retried(),
                    Ok(FailOutcome::FinalFailure) => {
                        METRICS.inc_jobs_failed();
                        record_metric(&self.store, &job, MetricStatus::Failed, None, "").await;
                    }
                    Err(e) => error!(job_id = %job.id, "Could not record dispatch failure: {e}"),
                }
            }
        }
    }

    async fn prepare(&self, job: &QueueJob) -> Result<(ExtractionPipeline, String), ExtractError> {
        let project = match self.store.projects().get_project(&job.project_id).await {
            Ok(project) => project,
            Err(DbError::NotFound(_)) => {
                return Err(ExtractError::InvalidBatch(format!(
                    "project {} not found",
                    job.project_id
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let pool = self.pools.pool_for(&project).await;
        let client = self.factory.client_for(&project);
        let pooled: Arc<dyn VisionClient> = Arc::new(PooledClient::new(client, pool));
        let model = project.llm.model.clone();
        Ok((ExtractionPipeline::new(self.store.clone(), pooled), model))
    }
}

/// Run one job to its terminal state and record the outcome.
async fn execute_job(
    store: Store,
    pipeline: ExtractionPipeline,
    job: QueueJob,
    model: String,
    backoff: Duration,
) {
    let result = pipeline.run(&job).await;
    let now = Utc::now();

    match result {
        Ok(report) => match store.queue().complete_job(&job.id, now).await {
            Ok(()) => {
                METRICS.inc_jobs_completed();
                record_success(&store, &job, &report).await;
            }
            Err(DbError::InvalidState(_)) => {
                // Canceled between the pipeline's cancel check and here.
                info!(job_id = %job.id, "Job canceled mid-flight; write discarded");
                METRICS.inc_jobs_discarded();
            }
            Err(e) => error!(job_id = %job.id, "Failed to complete job: {e}"),
        },
        Err(ExtractError::Canceled) => {
            info!(job_id = %job.id, "Job canceled mid-flight; write discarded");
            METRICS.inc_jobs_discarded();
        }
        Err(error) => {
            warn!(job_id = %job.id, "Job failed: {error}");
            let outcome = store
                .queue()
                .fail_job(&job.id, &error.to_string(), error.is_retriable(), backoff, now)
                .await;
            match outcome {
                Ok(FailOutcome::RetryScheduled { attempts }) => {
                    info!(job_id = %job.id, attempts, "Retry scheduled");
                    METRICS.inc_jobs_retried();
                }
                Ok(FailOutcome::FinalFailure) => {
                    METRICS.inc_jobs_failed();
                    record_metric(&store, &job, MetricStatus::Failed, None, &model).await;
                }
                Err(DbError::InvalidState(_)) => {
                    info!(job_id = %job.id, "Job canceled mid-flight; failure discarded");
                    METRICS.inc_jobs_discarded();
                }
                Err(e) => error!(job_id = %job.id, "Could not record job failure: {e}"),
            }
        }
    }
}

async fn record_success(store: &Store, job: &QueueJob, report: &PipelineReport) {
    record_metric(
        store,
        job,
        MetricStatus::Success,
        Some(report),
        &report.model,
    )
    .await;
}

/// Best effort: a metric-write failure is logged, never failing the job.
async fn record_metric(
    store: &Store,
    job: &QueueJob,
    status: MetricStatus,
    report: Option<&PipelineReport>,
    model: &str,
) {
    let now = Utc::now();
    let duration_ms = job
        .started_at
        .map(|started| (now - started).num_milliseconds().max(0))
        .unwrap_or(0);

    let metric = NewMetric {
        job_type: job.job_type,
        status,
        duration_ms,
        image_count: report.map(|r| r.image_count).unwrap_or(0),
        extraction_count: report.map(|r| r.extraction_count).unwrap_or(0),
        model: report
            .map(|r| r.model.clone())
            .unwrap_or_else(|| model.to_string()),
        tokens_used: report.and_then(|r| r.tokens_used),
        batch_id: job.batch_id.clone(),
        project_id: job.project_id.clone(),
    };

    if let Err(e) = store.metrics().record(&metric, now).await {
        warn!(job_id = %job.id, "Metric write failed: {e}");
        METRICS.inc_metric_write_errors();
    }
}
