// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimum-interval pacing for outbound remote calls.

use std::time::Duration;
use tokio::time::Instant;

/// Enforces a minimum wall-clock gap between consecutive calls to [`tick`].
///
/// The first tick never waits. Every later tick sleeps until at least the
/// configured interval has passed since the previous tick returned, so all
/// outbound traffic sharing one limiter is spaced out regardless of which
/// code path triggered it.
///
/// [`tick`]: RateLimiter::tick
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Waits until the interval since the previous tick has elapsed, then
    /// records the new tick time.
    pub async fn tick(&mut self) {
        if let Some(last) = self.last {
            let ready = last + self.interval;
            let now = Instant::now();
            if ready > now {
                tokio::time::sleep_until(ready).await;
            }
        }
        self.last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_tick_is_immediate() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(Duration::from_secs(5));
        limiter.tick().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_ticks_are_spaced() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(Duration::from_secs(5));
        limiter.tick().await;
        limiter.tick().await;
        limiter.tick().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_time_counts_toward_the_interval() {
        let mut limiter = RateLimiter::new(Duration::from_secs(5));
        limiter.tick().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let before = Instant::now();
        limiter.tick().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_never_waits() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(Duration::ZERO);
        for _ in 0..10 {
            limiter.tick().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
