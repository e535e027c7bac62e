//! Stoppers: tell a daemon or timer to finish, and why.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StopReason {
    /// The object is being deleted.
    Deletion,
    /// The object no longer matches the handler's filters.
    FiltersMismatch,
    /// The operator is exiting.
    OperatorExiting,
    /// The operator is paused (e.g. by a peer).
    OperatorPaused,
    /// The daemon's own task has finished; set by the framework.
    DaemonDone,
    /// The daemon's body was cancelled.
    DaemonCancelled,
}

/// A flag that both signals and reports why termination was requested.
///
/// Clones share the state. Setting it more than once accumulates reasons; the
/// first `set()` wakes all waiters.
#[derive(Debug, Clone, Default)]
pub struct DaemonStopper {
    token: CancellationToken,
    reasons: Arc<Mutex<BTreeSet<StopReason>>>,
}

impl DaemonStopper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, reason: StopReason) {
        self.reasons.lock().unwrap_or_else(|p| p.into_inner()).insert(reason);
        self.token.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reasons(&self) -> BTreeSet<StopReason> {
        self.reasons.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Whether anyone but the framework's own bookkeeping asked to stop.
    pub fn is_set_externally(&self) -> bool {
        self.reasons().iter().any(|r| !matches!(r, StopReason::DaemonDone | StopReason::DaemonCancelled))
    }

    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    /// Sleep for `delay` unless stopped first. Returns whether the sleep was interrupted.
    pub async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_wakes_waiters_and_keeps_reasons() {
        let stopper = DaemonStopper::new();
        let seen = stopper.clone();
        let waiter = tokio::spawn(async move {
            seen.wait().await;
            seen.reasons()
        });
        stopper.set(StopReason::Deletion);
        stopper.set(StopReason::OperatorExiting);
        let reasons = waiter.await.unwrap();
        assert!(reasons.contains(&StopReason::Deletion));
        assert!(stopper.is_set_externally());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_reports_interruption() {
        let stopper = DaemonStopper::new();
        assert!(!stopper.sleep(Duration::from_millis(10)).await);
        stopper.set(StopReason::DaemonDone);
        assert!(stopper.sleep(Duration::from_secs(100)).await);
        assert!(!stopper.is_set_externally());
    }
}
