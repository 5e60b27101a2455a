//! Dual-window request pacing.
//!
//! The CRM enforces two limits at once: a short-term requests-per-second
//! cap and a sliding per-minute cap. [`RateLimiter::acquire`] blocks until
//! both windows have room, so every request path simply awaits a permit
//! before sending.
//!
//! The mutex is a `tokio::sync::Mutex` held across the pacing sleep on
//! purpose: callers queue up in arrival order and permits are never
//! reordered or dropped.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const MINUTE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Windows {
    last_request: Option<Instant>,
    minute: VecDeque<Instant>,
}

/// Paces requests to `rate_per_second` with at most `rate_per_minute`
/// requests in any sliding 60-second window.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    rate_per_minute: usize,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(rate_per_second: f64, rate_per_minute: usize) -> Self {
        let min_interval = if rate_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / rate_per_second)
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            rate_per_minute: rate_per_minute.max(1),
            windows: Mutex::new(Windows { last_request: None, minute: VecDeque::new() }),
        }
    }

    /// Wait until both windows allow another request, then record it.
    pub async fn acquire(&self) {
        let mut windows = self.windows.lock().await;
        let mut now = Instant::now();

        // Per-second pacing
        if let Some(last) = windows.last_request {
            let next_allowed = last + self.min_interval;
            if next_allowed > now {
                tokio::time::sleep_until(next_allowed).await;
                now = Instant::now();
            }
        }

        // Sliding per-minute window
        while windows.minute.front().is_some_and(|t| now - *t >= MINUTE_WINDOW) {
            windows.minute.pop_front();
        }
        if windows.minute.len() >= self.rate_per_minute {
            // Oldest entry exists because the window is full
            if let Some(oldest) = windows.minute.front().copied() {
                let wake_at = oldest + MINUTE_WINDOW;
                debug!(wait = ?(wake_at - now), "Per-minute rate limit reached, pausing");
                tokio::time::sleep_until(wake_at).await;
                now = Instant::now();
                while windows.minute.front().is_some_and(|t| now - *t >= MINUTE_WINDOW) {
                    windows.minute.pop_front();
                }
            }
        }

        windows.minute.push_back(now);
        windows.last_request = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_paces_to_per_second_rate() {
        let limiter = RateLimiter::new(2.0, 1000);

        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        // 4 requests at 2/s need at least 1.5s of spacing
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_minute_window_blocks_burst() {
        let limiter = RateLimiter::new(1000.0, 3);

        for _ in 0..3 {
            limiter.acquire().await;
        }
        let start = Instant::now();
        limiter.acquire().await;
        // Fourth permit waits for the oldest to leave the 60s window
        assert!(start.elapsed() >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = RateLimiter::new(1000.0, 2);

        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.acquire().await;

        // The first permit aged out, so a third is immediate
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_serialized() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(10.0, 1000));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.acquire().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 5 permits at 10/s need at least 400ms
        assert!(start.elapsed() >= Duration::from_millis(400));
    }
}
