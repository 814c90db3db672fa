//! Injectable time and jitter sources.
//!
//! Retry schedules and watermark decisions both depend on "now" and on
//! random jitter; routing them through these traits keeps the schedules
//! testable without sleeping on real randomness.

use chrono::{DateTime, Utc};
use rand::Rng;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub trait JitterSource: Send + Sync {
    /// Uniform draw from `0..=max_ms`.
    fn jitter_ms(&self, max_ms: u64) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn jitter_ms(&self, max_ms: u64) -> u64 {
        rand::thread_rng().gen_range(0..=max_ms)
    }
}

/// Deterministic jitter for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub u64);

impl JitterSource for FixedJitter {
    fn jitter_ms(&self, max_ms: u64) -> u64 {
        self.0.min(max_ms)
    }
}
