//! Election timeout tracking with injectable time and randomness.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Source of election timeout jitter
pub trait RandomSource: Send {
    /// Uniform value in `min..=max`
    fn between(&mut self, min: u64, max: u64) -> u64;
}

#[derive(Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn between(&mut self, min: u64, max: u64) -> u64 {
        rand::thread_rng().gen_range(min..=max)
    }
}

/// Reproducible jitter for tests
#[derive(Debug)]
pub struct SeededRandom(StdRng);

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl RandomSource for SeededRandom {
    fn between(&mut self, min: u64, max: u64) -> u64 {
        self.0.gen_range(min..=max)
    }
}

/// Single-shot randomized election timer. Each reset draws a fresh timeout;
/// the timer fires once the clock passes the deadline.
pub struct ElectionTimer {
    min_ms: u64,
    max_ms: u64,
    clock: Arc<dyn Clock>,
    random: Box<dyn RandomSource>,
    deadline: Option<Instant>,
}

impl ElectionTimer {
    pub fn new(
        min_ms: u64,
        max_ms: u64,
        clock: Arc<dyn Clock>,
        random: Box<dyn RandomSource>,
    ) -> Self {
        assert!(min_ms <= max_ms, "election timeout range is inverted");
        Self {
            min_ms,
            max_ms,
            clock,
            random,
            deadline: None,
        }
    }

    /// Arm the timer with a fresh random timeout, returning it
    pub fn reset(&mut self) -> Duration {
        let timeout = Duration::from_millis(self.random.between(self.min_ms, self.max_ms));
        self.deadline = Some(self.clock.now() + timeout);
        timeout
    }

    /// Disarm the timer (leaders never time out)
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// True once, when the deadline has passed; the timer is then disarmed
    pub fn poll_expired(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if self.clock.now() >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
