use std::time::Duration;

/// Exponential reconnect delay: `base * 2^attempt`, capped at `max`.
///
/// Never gives up; the session keeps retrying until it reconnects or is shut
/// down.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    idx: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            idx: 0,
        }
    }

    pub fn reset(&mut self) {
        self.idx = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.idx
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.checked_pow(self.idx).unwrap_or(u32::MAX);
        let delay = self
            .base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max);
        // Stop growing the exponent once the cap is reached.
        if delay < self.max {
            self.idx += 1;
        }
        delay
    }
}
