//! Dispatch rate limiting over a rolling window
//!
//! A window opens at the first acquisition after the previous window expired.
//! Up to `limit` acquisitions succeed immediately within the window; later
//! callers sleep until it rolls over. Time comes from [`tokio::time::Instant`],
//! so tests can drive the limiter with tokio's paused clock.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct RateWindow {
    start: Option<Instant>,
    count: u32,
}

/// Caps the number of operations per rolling window, shared by all workers
#[derive(Clone, Debug)]
pub struct RateLimiter {
    limit: Option<u32>,
    window: Duration,
    state: Arc<Mutex<RateWindow>>,
}

impl RateLimiter {
    /// Create a limiter allowing `limit` operations per `window` (None = unlimited)
    ///
    /// # Examples
    ///
    /// ```
    /// use batch_dispatch::rate_limiter::RateLimiter;
    /// use std::time::Duration;
    ///
    /// // 120 requests per minute
    /// let limiter = RateLimiter::new(Some(120), Duration::from_secs(60));
    ///
    /// // Unlimited
    /// let unlimited = RateLimiter::new(None, Duration::from_secs(60));
    /// assert_eq!(unlimited.limit(), None);
    /// ```
    #[must_use]
    pub fn new(limit: Option<u32>, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Arc::new(Mutex::new(RateWindow::default())),
        }
    }

    /// The configured limit per window
    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// Wait until one more operation fits in the current window, then claim it
    ///
    /// Returns how long the caller waited. Returns immediately when unlimited.
    pub async fn acquire(&self) -> Duration {
        let Some(limit) = self.limit else {
            return Duration::ZERO;
        };

        let started = Instant::now();
        loop {
            let rollover = {
                let mut window = self.state.lock().await;
                let now = Instant::now();
                let start = match window.start {
                    Some(start) if now < start + self.window => start,
                    _ => {
                        window.start = Some(now);
                        window.count = 0;
                        now
                    }
                };

                if window.count < limit {
                    window.count += 1;
                    return started.elapsed();
                }
                start + self.window
            };

            tracing::debug!(
                limit,
                wait_ms = rollover.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Reached the rate limit, waiting for the window to roll over"
            );
            tokio::time::sleep_until(rollover).await;
        }
    }

    /// Operations claimed in the current window
    pub async fn in_window(&self) -> u32 {
        let window = self.state.lock().await;
        match window.start {
            Some(start) if Instant::now() < start + self.window => window.count,
            _ => 0,
        }
    }
}
