//! DocGrid engine: queue manager, worker runtime, and per-project
//! admission control.
//!
//! The engine is the control plane between adapters and the extraction
//! pipelines. Adapters talk to `QueueManager`; the host process starts one
//! `Worker` per process and stops it through its `WorkerHandle`. There is
//! no module-level singleton: store, manager, and worker are explicit
//! dependencies wired by the caller.

pub mod client;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod worker;

pub use client::PooledClient;
pub use manager::{CancelOutcome, EnqueueManyOutcome, ManagerError, QueueManager};
pub use metrics::{Metrics, MetricsSnapshot, METRICS};
pub use pool::{ProjectPool, ProjectPools};
pub use worker::{ClientFactory, Worker, WorkerConfig, WorkerHandle};
