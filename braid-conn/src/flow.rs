//! Byte-rate limiting and flow accounting for the stream halves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Token-bucket throttle for one direction of the stream. Capacity equals
/// one second of budget, so short bursts pass and sustained traffic
/// converges on the configured rate.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    /// Bytes per second; zero disables throttling.
    rate: u64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub(crate) fn new(rate: u64) -> Self {
        Self {
            rate,
            tokens: rate as f64,
            last_refill: Instant::now(),
        }
    }

    /// Charge `bytes` against the bucket, sleeping until the budget covers
    /// them. Charges larger than one second of budget borrow ahead.
    pub(crate) async fn throttle(&mut self, bytes: usize) {
        if self.rate == 0 {
            return;
        }

        let now = Instant::now();
        let refill = now.duration_since(self.last_refill).as_secs_f64() * self.rate as f64;
        self.tokens = (self.tokens + refill).min(self.rate as f64);
        self.last_refill = now;

        let need = bytes as f64;
        if self.tokens >= need {
            self.tokens -= need;
            return;
        }

        let deficit = need - self.tokens;
        self.tokens = 0.0;
        tokio::time::sleep(Duration::from_secs_f64(deficit / self.rate as f64)).await;
        self.last_refill = Instant::now();
    }
}

/// Cumulative byte counter for one direction, shared between a loop and
/// status queries.
#[derive(Debug)]
pub(crate) struct FlowMeter {
    started: Instant,
    total: AtomicU64,
}

impl FlowMeter {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
            total: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self, bytes: usize) {
        self.total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub(crate) fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Average byte rate since the meter was created.
    pub(crate) fn rate(&self) -> u64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0;
        }
        (self.total() as f64 / elapsed) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_bucket_never_sleeps() {
        let mut bucket = TokenBucket::new(0);
        let start = Instant::now();
        bucket.throttle(10_000_000).await;
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_budget_passes() {
        let mut bucket = TokenBucket::new(1000);
        let start = Instant::now();
        bucket.throttle(1000).await;
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_traffic_is_paced() {
        let mut bucket = TokenBucket::new(1000);
        let start = Instant::now();

        // Two seconds of budget charged back to back: the second charge
        // must wait for refill.
        bucket.throttle(1000).await;
        bucket.throttle(1000).await;

        assert!(Instant::now() - start >= Duration::from_millis(999));
    }

    #[tokio::test]
    async fn test_meter_accumulates() {
        let meter = FlowMeter::new();
        meter.record(512);
        meter.record(512);
        assert_eq!(meter.total(), 1024);
    }
}
