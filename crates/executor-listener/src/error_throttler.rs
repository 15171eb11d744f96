// Exponential backoff for repeated failures talking to the queue or the
// isolation backend. Each worker task owns one throttler.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const BACKOFF_MULTIPLIER: u32 = 2;

/// Doubles its delay on every failure, from `min` up to `max`.
#[derive(Debug, Clone)]
pub struct ErrorThrottler {
    min: Duration,
    max: Duration,
    current_delay: Duration,
    consecutive_failures: u32,
}

impl ErrorThrottler {
    pub fn new() -> Self {
        Self::with_bounds(MIN_BACKOFF, MAX_BACKOFF)
    }

    pub fn with_bounds(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current_delay: min,
            consecutive_failures: 0,
        }
    }

    /// Forget past failures after a successful round trip.
    pub fn reset(&mut self) {
        self.current_delay = self.min;
        self.consecutive_failures = 0;
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record a failure and sleep for the current delay.
    ///
    /// Returns `false` if `cancel` fired before the delay elapsed.
    pub async fn increment_and_wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.current_delay;
        self.increment();

        tracing::warn!(
            failures = self.consecutive_failures,
            "backing off for {:.1}s",
            delay.as_secs_f64()
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }

    pub fn increment(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.current_delay = self
            .current_delay
            .saturating_mul(BACKOFF_MULTIPLIER)
            .min(self.max);
    }
}

impl Default for ErrorThrottler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_the_ceiling() {
        let mut throttler = ErrorThrottler::new();
        assert_eq!(throttler.current_delay(), MIN_BACKOFF);
        throttler.increment();
        assert_eq!(throttler.current_delay(), Duration::from_secs(2));
        throttler.increment();
        assert_eq!(throttler.current_delay(), Duration::from_secs(4));
        for _ in 0..20 {
            throttler.increment();
        }
        assert_eq!(throttler.current_delay(), MAX_BACKOFF);
        assert_eq!(throttler.consecutive_failures(), 22);
    }

    #[test]
    fn reset_returns_to_floor() {
        let mut throttler = ErrorThrottler::with_bounds(Duration::from_millis(10), Duration::from_secs(1));
        throttler.increment();
        throttler.increment();
        throttler.reset();
        assert_eq!(throttler.current_delay(), Duration::from_millis(10));
        assert_eq!(throttler.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_then_grows() {
        let mut throttler = ErrorThrottler::new();
        let started = tokio::time::Instant::now();
        assert!(throttler.increment_and_wait(&CancellationToken::new()).await);
        assert!(started.elapsed() >= MIN_BACKOFF);
        assert_eq!(throttler.current_delay(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cancelled_wait_returns_false() {
        let mut throttler = ErrorThrottler::with_bounds(Duration::from_secs(30), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!throttler.increment_and_wait(&cancel).await);
    }
}
