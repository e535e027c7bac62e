use std::time::Duration;

use tracing::info;

/// Per-object back-off after failures of the cluster API.
///
/// Each consecutive failure takes the next delay from the configured sequence;
/// once it runs out, the last delay repeats. Any success resets it.
#[derive(Debug, Default)]
pub struct Throttler {
    failures: usize,
}

impl Throttler {
    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn is_active(&self) -> bool {
        self.failures > 0
    }

    /// Register one more failure; `None` if there is nothing to wait for.
    pub fn next_delay(&mut self, delays: &[Duration]) -> Option<Duration> {
        let delay = delays.get(self.failures).or(delays.last()).copied();
        self.failures += 1;
        delay
    }

    pub fn reset(&mut self) {
        if self.failures > 0 {
            info!(failures = self.failures, "throttling is over; back to normal operations");
        }
        self.failures = 0;
    }
}
