//! Awaitable flags and interruptible sleeps.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// A resettable, awaitable boolean.
///
/// Used as the per-object "pressure" signal: raised when new events arrive for
/// an object, it interrupts whatever sleep that object's worker is in.
#[derive(Debug, Clone)]
pub struct Flag {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

impl Flag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: std::sync::Arc::new(tx) }
    }

    pub fn raise(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_raised(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|raised| *raised).await;
    }
}

/// Sleep for `delay` unless the flag is raised first.
///
/// Returns `None` if the full delay was slept, or the unslept remainder if the
/// sleep was interrupted. A raised flag interrupts immediately.
pub async fn sleep_or_wait(delay: Duration, wakeup: Option<&Flag>) -> Option<Duration> {
    let deadline = Instant::now() + delay;
    match wakeup {
        None => {
            tokio::time::sleep_until(deadline).await;
            None
        }
        Some(flag) => {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => None,
                _ = flag.wait() => Some(deadline.saturating_duration_since(Instant::now())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn full_sleep_returns_none() {
        let flag = Flag::new();
        assert_eq!(sleep_or_wait(Duration::from_secs(5), Some(&flag)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn raised_flag_interrupts_with_remainder() {
        let flag = Flag::new();
        let raiser = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            raiser.raise();
        });
        let left = sleep_or_wait(Duration::from_secs(10), Some(&flag)).await;
        assert_eq!(left, Some(Duration::from_secs(8)));
        assert!(flag.is_raised());
        flag.clear();
        assert!(!flag.is_raised());
    }

    #[tokio::test(start_paused = true)]
    async fn already_raised_flag_skips_the_sleep() {
        let flag = Flag::new();
        flag.raise();
        let left = sleep_or_wait(Duration::from_secs(3), Some(&flag)).await;
        assert_eq!(left, Some(Duration::from_secs(3)));
    }
}
