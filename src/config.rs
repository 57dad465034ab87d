//! Runtime tunables for a sync controller

use std::time::Duration;

use crate::retry::RetryConfig;

/// Default number of concurrent workers per controller
pub const DEFAULT_WORKERS: usize = 4;

/// Default deadline for one pipeline pass
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Server-side watch timeout; kept below the client read timeout so idle
/// watches are closed by the API server rather than by the client
pub const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 25;

/// Per-key reconcile budget
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Passes admitted per key per window
    pub max_per_window: u32,
    /// Window length
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// Configuration for one sync controller
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Concurrent pipeline passes (distinct keys only)
    pub workers: usize,
    /// Deadline for one pass; an expired pass is retried
    pub reconcile_timeout: Duration,
    /// Server-side timeout for watch requests
    pub watch_timeout_secs: u32,
    /// Backoff for requeued keys and reopened watches
    pub requeue_backoff: RetryConfig,
    /// Per-key rate limit; `None` disables the check
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            watch_timeout_secs: DEFAULT_WATCH_TIMEOUT_SECS,
            requeue_backoff: RetryConfig::default(),
            rate_limit: None,
        }
    }
}

impl SyncConfig {
    /// Set the worker count (at least one)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Enable per-key rate limiting
    pub fn with_rate_limit(mut self, max_per_window: u32, window: Duration) -> Self {
        self.rate_limit = Some(RateLimitConfig {
            max_per_window,
            window,
        });
        self
    }
}
