//! DocGrid daemon and queue administration CLI.
//!
//! Usage:
//!     docgrid serve
//!     docgrid enqueue --project <id> <batch-id>...
//!     docgrid stats [--project <id>]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use docgrid_db::{RetryScope, Store};
use docgrid_engine::{QueueManager, Worker, WorkerConfig};
use docgrid_logging::{docgrid_home, init_logging, LogConfig};
use docgrid_protocol::config::SystemConfig;
use docgrid_protocol::BatchStatus;

#[derive(Parser, Debug)]
#[command(name = "docgrid", about = "Document-to-table extraction engine")]
struct Args {
    /// Database URL (sqlite:/path/to/docgrid.db)
    #[arg(long, env = "DOCGRID_DB")]
    database: Option<String>,

    /// Verbose console logging
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the extraction worker until interrupted
    Serve,
    /// Show queue counts and recent processing metrics
    Stats {
        #[arg(long)]
        project: Option<String>,
    },
    /// Enqueue full-batch extraction jobs
    Enqueue {
        #[arg(long)]
        project: String,
        #[arg(long)]
        priority: Option<i64>,
        /// Batch ids to enqueue
        #[arg(required = true)]
        batches: Vec<String>,
    },
    /// Reset a batch and re-extract it
    Reprocess {
        #[arg(long)]
        project: String,
        batch: String,
    },
    /// Cancel jobs (optionally restricted to batches)
    Cancel {
        #[arg(long)]
        project: String,
        batches: Vec<String>,
    },
    /// Requeue failed jobs for a job id or a whole project
    Retry {
        #[arg(long, conflicts_with = "project")]
        job: Option<String>,
        #[arg(long)]
        project: Option<String>,
    },
    /// Show one job
    Job { id: String },
    /// Set batch status (pending | review | approved | failed)
    SetStatus {
        #[arg(long)]
        project: String,
        #[arg(long)]
        status: String,
        #[arg(required = true)]
        batches: Vec<String>,
    },
    /// Delete batches with their rows and images
    Delete {
        #[arg(long)]
        project: String,
        #[arg(required = true)]
        batches: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(LogConfig {
        app_name: "docgrid",
        verbose: args.verbose,
    })?;

    let config = match &args.database {
        Some(database) => SystemConfig {
            database_url: database.clone(),
            ..SystemConfig::default()
        },
        None => {
            let home = docgrid_home();
            std::fs::create_dir_all(&home)
                .with_context(|| format!("Failed to create {}", home.display()))?;
            SystemConfig::with_home(&home)
        }
    };

    let store = Store::open(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    let manager = QueueManager::new(store.clone());

    match args.command {
        Command::Serve => serve(store, &config).await,
        Command::Stats { project } => {
            let stats = manager.stats(project.as_deref()).await?;
            println!(
                "queued: {}  processing: {}  completed: {}  failed: {}  total: {}",
                stats.queued, stats.processing, stats.completed, stats.failed, stats.total
            );
            let metrics = store.metrics().recent(10).await?;
            if !metrics.is_empty() {
                println!("\nrecent jobs:");
                for metric in metrics {
                    println!(
                        "  {} {} {} batch={} {}ms {} extraction(s)",
                        metric.created_at.format("%Y-%m-%d %H:%M:%S"),
                        metric.job_type,
                        metric.status,
                        metric.batch_id,
                        metric.duration_ms,
                        metric.extraction_count,
                    );
                }
            }
            Ok(())
        }
        Command::Enqueue {
            project,
            priority,
            batches,
        } => {
            let outcome = manager.enqueue_many(&batches, &project, priority).await?;
            for job_id in &outcome.job_ids {
                println!("enqueued {job_id}");
            }
            if let Some((index, error)) = outcome.failed {
                bail!("failed at batch {} ({}): {}", index, batches[index], error);
            }
            Ok(())
        }
        Command::Reprocess { project, batch } => {
            let job = manager.reprocess_batch(&batch, &project, None).await?;
            println!("enqueued {}", job.id);
            Ok(())
        }
        Command::Cancel { project, batches } => {
            let batch_ids = if batches.is_empty() {
                None
            } else {
                Some(batches)
            };
            let outcome = manager.cancel(&project, batch_ids).await?;
            println!(
                "canceled {} job(s), reset {} batch(es)",
                outcome.canceled_jobs, outcome.reset_batches
            );
            Ok(())
        }
        Command::Retry { job, project } => {
            let scope = match (job, project) {
                (Some(job_id), _) => RetryScope::Job(job_id),
                (None, Some(project_id)) => RetryScope::Project(project_id),
                (None, None) => bail!("pass --job or --project"),
            };
            let retried = manager.retry(scope).await?;
            println!("requeued {retried} job(s)");
            Ok(())
        }
        Command::Job { id } => {
            match manager.job(&id).await? {
                Some(job) => {
                    println!("id:        {}", job.id);
                    println!("type:      {}", job.job_type);
                    println!("status:    {}", job.status);
                    println!("priority:  {}", job.priority);
                    println!("project:   {}", job.project_id);
                    println!("batch:     {}", job.batch_id);
                    println!("attempts:  {}/{}", job.attempts, job.max_attempts);
                    println!("created:   {}", job.created_at.to_rfc3339());
                    if let Some(started) = job.started_at {
                        println!("started:   {}", started.to_rfc3339());
                    }
                    if let Some(completed) = job.completed_at {
                        println!("completed: {}", completed.to_rfc3339());
                    }
                    if let Some(error) = &job.error {
                        println!("error:     {error}");
                    }
                }
                None => bail!("job {id} not found"),
            }
            Ok(())
        }
        Command::SetStatus {
            project,
            status,
            batches,
        } => {
            let target: BatchStatus = status
                .parse()
                .map_err(|e| anyhow::anyhow!("{e} (expected pending|review|approved|failed)"))?;
            let updated = manager.set_batch_status(&batches, target, &project).await?;
            println!("updated {updated} batch(es)");
            Ok(())
        }
        Command::Delete { project, batches } => {
            let deleted = manager.delete_batches(&batches, &project).await?;
            println!("deleted {deleted} batch(es)");
            Ok(())
        }
    }
}

async fn serve(store: Store, config: &SystemConfig) -> Result<()> {
    tracing::info!("Starting DocGrid worker");
    tracing::info!("  Database: {}", config.database_url);

    let worker = Worker::new(store, WorkerConfig::from(config));
    let handle = worker.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received, draining");
    handle.shutdown().await;
    Ok(())
}
