//! System configuration consumed by the launcher.

use std::path::PathBuf;
use std::time::Duration;

use crate::defaults;

/// Canonical system configuration used by the `docgrid` binary and the
/// worker runtime.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// SQLite database URL (`sqlite:/path/to/docgrid.db`).
    pub database_url: String,
    /// Worker lease poll interval.
    pub poll_interval: Duration,
    /// Backoff applied before a retriable failure re-enters the queue.
    pub retry_backoff: Duration,
    /// How long shutdown waits for in-flight pipelines before giving up.
    pub drain_timeout: Duration,
}

impl SystemConfig {
    /// Config pointing at the standard on-disk database under `home`.
    pub fn with_home(home: &PathBuf) -> Self {
        Self {
            database_url: format!("sqlite:{}", home.join(defaults::DEFAULT_DB_FILE).display()),
            ..Self::default()
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            database_url: format!("sqlite:{}", defaults::DEFAULT_DB_FILE),
            poll_interval: Duration::from_millis(defaults::DEFAULT_POLL_INTERVAL_MS),
            retry_backoff: Duration::from_secs(defaults::DEFAULT_RETRY_BACKOFF_SECS),
            drain_timeout: Duration::from_secs(defaults::DEFAULT_DRAIN_TIMEOUT_SECS),
        }
    }
}
