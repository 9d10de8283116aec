//! Single-shot deadline driven by caller supplied time.

use std::time::{Duration, Instant};

/// A one-shot timer that never fires on its own.
///
/// State machines arm it with the current instant and ask whether it has
/// expired when they are polled.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleShotTimer {
    deadline: Option<Instant>,
}

impl SingleShotTimer {
    /// Create an inactive timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, replacing any previous deadline.
    pub fn start(&mut self, now: Instant, duration: Duration) {
        self.deadline = Some(now + duration);
    }

    /// Disarm the timer.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    /// Armed and not yet expired.
    pub fn is_active(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now < deadline)
    }

    /// Armed and past its deadline.
    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}
