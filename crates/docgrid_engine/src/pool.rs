//! Per-project admission control for outbound LLM requests.
//!
//! Two gates, passed in order:
//!
//! 1. A concurrency semaphore sized `enable_parallel_requests ? N : 1`.
//! 2. A sliding 60-second window of request start stamps. A waiter that
//!    finds the window full sleeps until the oldest stamp falls out, then
//!    re-checks. The waiter holds the window lock while it sleeps, so
//!    admission is strictly FIFO and backoff never reorders waiters.
//!
//! Stamps are recorded at request start and are NOT removed when a request
//! finishes; bursty completion therefore cannot let a follow-up burst
//! exceed the per-minute ceiling. The pool never drops work, it only
//! defers it. Dropping a queued waiter (cancellation) removes it cleanly
//! without stamping.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use docgrid_protocol::defaults::RATE_WINDOW_SECS;
use docgrid_protocol::Project;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info};

const WINDOW: Duration = Duration::from_secs(RATE_WINDOW_SECS);

pub struct ProjectPool {
    project_id: String,
    requests_per_minute: AtomicU32,
    max_concurrency: AtomicUsize,
    semaphore: Arc<Semaphore>,
    /// Request start stamps within the sliding window, oldest first.
    window: Mutex<VecDeque<Instant>>,
}

impl ProjectPool {
    pub fn new(project_id: impl Into<String>, requests_per_minute: u32, max_concurrency: usize) -> Arc<Self> {
        let max_concurrency = max_concurrency.max(1);
        Arc::new(Self {
            project_id: project_id.into(),
            requests_per_minute: AtomicU32::new(requests_per_minute.max(1)),
            max_concurrency: AtomicUsize::new(max_concurrency),
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            window: Mutex::new(VecDeque::new()),
        })
    }

    /// Run `f` under both gates. The permit is held for the duration of the
    /// call and released on return, success or failure.
    pub async fn execute<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore is never closed");
        self.admit().await;
        f().await
    }

    /// Wait for a rate slot and stamp the request start.
    async fn admit(&self) {
        let mut window = self.window.lock().await;
        loop {
            let now = Instant::now();
            while window
                .front()
                .is_some_and(|stamp| *stamp + WINDOW <= now)
            {
                window.pop_front();
            }

            let limit = self.requests_per_minute.load(Ordering::Relaxed) as usize;
            if window.len() < limit {
                window.push_back(now);
                return;
            }

            // Sleep (holding the gate, to stay FIFO) until the oldest stamp
            // leaves the window, then re-check.
            let oldest = window[0];
            debug!(project_id = %self.project_id, "Rate window full, deferring request");
            sleep_until(oldest + WINDOW).await;
        }
    }

    /// Apply new limits; effective on the next admission decision. Lowering
    /// concurrency burns surplus permits in the background and never
    /// interrupts in-flight work.
    pub fn set_limits(self: &Arc<Self>, requests_per_minute: u32, max_concurrency: usize) {
        self.requests_per_minute
            .store(requests_per_minute.max(1), Ordering::Relaxed);

        let target = max_concurrency.max(1);
        let current = self.max_concurrency.swap(target, Ordering::SeqCst);
        if target > current {
            self.semaphore.add_permits(target - current);
        } else if target < current {
            let semaphore = self.semaphore.clone();
            let surplus = (current - target) as u32;
            tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(surplus).await {
                    permits.forget();
                }
            });
        }
        if target != current {
            info!(project_id = %self.project_id, requests_per_minute, max_concurrency = target, "Pool limits updated");
        }
    }

    /// Requests currently inside `execute`'s guarded section.
    pub fn active(&self) -> usize {
        self.max_concurrency.load(Ordering::SeqCst) - self.semaphore.available_permits()
    }
}

/// Registry of per-project pools. Limits are refreshed from the project
/// settings on every lookup, so settings changes apply to the next
/// admission decision.
#[derive(Default)]
pub struct ProjectPools {
    pools: Mutex<HashMap<String, Arc<ProjectPool>>>,
}

impl ProjectPools {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn pool_for(&self, project: &Project) -> Arc<ProjectPool> {
        let requests_per_minute = project.limits.requests_per_minute;
        let max_concurrency = project.limits.max_concurrency() as usize;

        let mut pools = self.pools.lock().await;
        match pools.get(&project.id) {
            Some(pool) => {
                pool.set_limits(requests_per_minute, max_concurrency);
                pool.clone()
            }
            None => {
                let pool = ProjectPool::new(&project.id, requests_per_minute, max_concurrency);
                pools.insert(project.id.clone(), pool.clone());
                pool
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn elapsed_secs(start: Instant, at: Instant) -> u64 {
        at.duration_since(start).as_secs()
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_defers_third_request() {
        let pool = ProjectPool::new("p1", 2, 10);
        let start = Instant::now();
        let starts = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let pool = pool.clone();
            let starts = starts.clone();
            handles.push(tokio::spawn(async move {
                pool.execute(|| async {
                    starts.lock().await.push(Instant::now());
                })
                .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let starts = starts.lock().await;
        assert_eq!(starts.len(), 3);
        assert_eq!(elapsed_secs(start, starts[0]), 0);
        assert_eq!(elapsed_secs(start, starts[1]), 0);
        // The third call waits until the first stamp leaves the window.
        assert_eq!(elapsed_secs(start, starts[2]), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stamps_survive_fast_completion() {
        // Three quick requests complete immediately; the window still
        // counts them, so a fourth within the same minute is deferred.
        let pool = ProjectPool::new("p1", 3, 10);
        let start = Instant::now();

        for _ in 0..3 {
            pool.execute(|| async {}).await;
        }
        let mut admitted_at = None;
        pool.execute(|| async {
            admitted_at = Some(Instant::now());
        })
        .await;

        assert_eq!(elapsed_secs(start, admitted_at.unwrap()), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_serializes_serial_mode() {
        let pool = ProjectPool::new("p1", 1000, 1);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.execute(|| async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_mode_allows_overlap_up_to_cap() {
        let pool = ProjectPool::new("p1", 1000, 3);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.execute(|| async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_is_fifo() {
        let pool = ProjectPool::new("p1", 1, 10);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for index in 0..4usize {
            let pool = pool.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                pool.execute(|| async {
                    order.lock().await.push(index);
                })
                .await;
            }));
            // Make the enqueue order deterministic.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_canceled_waiter_leaves_no_stamp() {
        let pool = ProjectPool::new("p1", 1, 10);
        pool.execute(|| async {}).await;

        // This waiter would be admitted at t=60s; cancel it first.
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.execute(|| async {}).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        // The canceled waiter left no stamp: after the first stamp expires
        // the window admits immediately.
        let start = Instant::now();
        pool.execute(|| async {}).await;
        assert_eq!(Instant::now().duration_since(start).as_secs(), 59);

        let window = pool.window.lock().await;
        assert_eq!(window.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_update_applies_to_next_admission() {
        let pool = ProjectPool::new("p1", 1, 1);
        pool.execute(|| async {}).await;

        pool.set_limits(10, 1);
        let start = Instant::now();
        pool.execute(|| async {}).await;
        // With the raised limit the second call is admitted immediately.
        assert_eq!(Instant::now().duration_since(start).as_secs(), 0);
    }

    #[tokio::test]
    async fn test_pools_registry_reuses_and_refreshes() {
        use docgrid_protocol::{
            ColumnDefinition, ColumnType, CoordinateFormat, FeatureFlags, LlmSettings,
            RateLimitSettings,
        };
        let mut project = Project {
            id: "p1".to_string(),
            owner_id: "u1".to_string(),
            name: "P".to_string(),
            columns: vec![ColumnDefinition {
                id: "a".to_string(),
                name: "A".to_string(),
                column_type: ColumnType::Text,
                description: None,
                allowed_values: None,
                validation_pattern: None,
            }],
            flags: FeatureFlags::default(),
            llm: LlmSettings {
                endpoint_url: "https://llm.example".to_string(),
                model: "m".to_string(),
                api_key: "k".to_string(),
            },
            limits: RateLimitSettings::default(),
            request_timeout_secs: 60,
            coordinate_format: CoordinateFormat::default(),
        };

        let pools = ProjectPools::new();
        let first = pools.pool_for(&project).await;

        project.limits.requests_per_minute = 99;
        let second = pools.pool_for(&project).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.requests_per_minute.load(Ordering::Relaxed), 99);
    }
}
