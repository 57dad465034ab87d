//! Per-key reconcile rate limiting
//!
//! Guards against hot loops where two clusters keep rewriting the same
//! object: once a key exceeds its budget for the current window, passes for
//! it end early until the window rolls over.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Entries kept before expired windows are swept
const SWEEP_THRESHOLD: usize = 1024;

/// Outcome of one rate-limit query
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request is over budget
    pub limited: bool,
    /// Admissions allowed per window
    pub limit: u32,
    /// Admissions left in the current window
    pub remaining: u32,
    /// Time until the current window resets
    pub reset_after: Duration,
    /// When limited, how long until a retry could be admitted
    pub retry_after: Option<Duration>,
}

/// Rate limiter consulted once per pipeline pass
#[cfg_attr(test, automock)]
pub trait RateLimiter: Send + Sync {
    /// Charge `cost` against `key`
    fn rate_limit(&self, key: &str, cost: u32) -> Result<RateLimitResult, Error>;
}

#[derive(Clone, Copy, Debug)]
struct Window {
    started: Instant,
    used: u32,
}

/// Fixed-window limiter: at most `max_per_window` admissions per key per `window`
#[derive(Debug)]
pub struct WindowRateLimiter {
    max_per_window: u32,
    window: Duration,
    windows: DashMap<String, Window>,
}

impl WindowRateLimiter {
    /// Create a limiter
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            windows: DashMap::new(),
        }
    }

    fn sweep(&self, now: Instant) {
        self.windows
            .retain(|_, w| now.duration_since(w.started) < self.window);
    }
}

impl RateLimiter for WindowRateLimiter {
    fn rate_limit(&self, key: &str, cost: u32) -> Result<RateLimitResult, Error> {
        let now = Instant::now();
        if self.windows.len() > SWEEP_THRESHOLD {
            self.sweep(now);
        }

        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            used: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            *entry = Window {
                started: now,
                used: 0,
            };
        }

        // A cost above the whole budget never fits; it stays limited and is
        // retried once per window instead of failing the pass.
        let reset_after = self.window.saturating_sub(now.duration_since(entry.started));
        let limited = entry.used.saturating_add(cost) > self.max_per_window;
        if !limited {
            entry.used += cost;
        }

        Ok(RateLimitResult {
            limited,
            limit: self.max_per_window,
            remaining: self.max_per_window - entry.used,
            reset_after,
            retry_after: limited.then_some(reset_after),
        })
    }
}
