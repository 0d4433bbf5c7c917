//! Token bucket limiting a connection's output rate.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RateLimiter {
    bytes_per_sec: u64,
    burst: usize,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// `burst` also caps a single write.
    pub fn new(bytes_per_sec: u64, burst: usize, now: Instant) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec.max(1),
            burst: burst.max(1),
            tokens: burst.max(1) as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.bytes_per_sec as f64).min(self.burst as f64);
        self.last_refill = now;
    }

    /// Bytes that may be written now.
    pub fn allowance(&mut self, now: Instant) -> usize {
        self.refill(now);
        (self.tokens as usize).min(self.burst)
    }

    pub fn consume(&mut self, bytes: usize) {
        self.tokens = (self.tokens - bytes as f64).max(0.0);
    }

    /// Threshold at which a throttled connection resumes writing.
    fn resume_threshold(&self) -> usize {
        ((self.bytes_per_sec / 20) as usize).clamp(1, self.burst)
    }

    /// When enough tokens will be available to resume writing.
    pub fn resume_at(&self, now: Instant) -> Instant {
        let missing = self.resume_threshold() as f64 - self.tokens;
        if missing <= 0.0 {
            return now;
        }
        now + Duration::from_secs_f64(missing / self.bytes_per_sec as f64)
    }
}
