//! Fixed-window request budgets, one window per provider.
//!
//! Each key owns a counter that resets when its window elapses. The check and
//! the increment happen under the DashMap entry guard, so concurrent callers
//! racing for the last slot cannot both succeed. Rejected attempts never
//! consume budget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limited: `{key}` used its {limit} requests, retry after {retry_after:?}")]
    Exceeded {
        key: String,
        limit: u32,
        retry_after: Duration,
    },
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            count: 0,
        }
    }

    fn roll(&mut self, now: Instant, length: Duration) {
        if now.duration_since(self.started) >= length {
            self.started = now;
            self.count = 0;
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RateLimiter {
    window_secs: AtomicU64,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window_secs: AtomicU64::new(window.as_secs().max(1)),
            windows: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.load(Ordering::Relaxed))
    }

    /// Change the window length. Applies to windows that start afterwards.
    pub fn set_window(&self, window: Duration) {
        self.window_secs
            .store(window.as_secs().max(1), Ordering::Relaxed);
    }

    /// Take one slot from `key`'s budget of `limit` per window.
    ///
    /// A `limit` of zero means unlimited and always succeeds.
    pub fn try_acquire(&self, key: &str, limit: u32) -> Result<(), RateLimitError> {
        if limit == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let length = self.window();
        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Window::new(now));
        window.roll(now, length);

        if window.count >= limit {
            let retry_after = length.saturating_sub(now.duration_since(window.started));
            debug!(key, limit, ?retry_after, "rate budget exhausted");
            return Err(RateLimitError::Exceeded {
                key: key.to_string(),
                limit,
                retry_after,
            });
        }
        window.count += 1;
        Ok(())
    }

    /// Slots left in the current window.
    pub fn remaining(&self, key: &str, limit: u32) -> u32 {
        let length = self.window();
        match self.windows.get(key) {
            Some(w) if Instant::now().duration_since(w.started) < length => {
                limit.saturating_sub(w.count)
            }
            _ => limit,
        }
    }

    pub fn reset(&self, key: &str) {
        self.windows.remove(key);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}
