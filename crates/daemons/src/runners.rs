use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use kreact_core::patches::Patch;
use kreact_execution::{
    execute_handler_once, CauseInfo, DaemonStopper, HandlerContext, HandlerState, Outcome, SpawningHandler,
    SpawningKind, StopReason, DEFAULT_BACKOFF,
};
use tokio::time::Instant;
use tokio_util::sync::DropGuard;
use tracing::{debug, info, warn};

use crate::memory::{lock, DaemonsMemory};
use crate::DaemonEnv;

/// How long a timer pauses after a run. Sharp timers keep to the grid of
/// `interval` counted from their first run, so slow bodies do not drift it.
pub fn next_run_delay(interval: Option<Duration>, idle: Option<Duration>, sharp: bool, since_start: Duration) -> Duration {
    match interval {
        Some(interval) if sharp && !interval.is_zero() => {
            let into_period = since_start.as_nanos() % interval.as_nanos();
            interval - Duration::from_nanos(into_period as u64)
        }
        Some(interval) => interval,
        None => idle.unwrap_or(Duration::ZERO),
    }
}

pub(crate) struct Runner {
    pub(crate) handler: SpawningHandler,
    pub(crate) env: DaemonEnv,
    pub(crate) stopper: DaemonStopper,
    pub(crate) memory: DaemonsMemory,
    pub(crate) guard: Arc<DropGuard>,
}

impl Runner {
    pub(crate) async fn run(self) {
        let interrupted = match self.handler.initial_delay {
            Some(delay) => self.stopper.sleep(delay).await,
            None => false,
        };
        if !interrupted {
            match self.handler.kind.clone() {
                SpawningKind::Daemon { .. } => self.run_daemon().await,
                SpawningKind::Timer { interval, idle, sharp } => self.run_timer(interval, idle, sharp).await,
            }
        }
        if self.stopper.is_set_externally() {
            debug!("daemon stopped");
        } else {
            info!("daemon exited on its own; not restarted for this object");
            self.memory.stop_forever(&self.handler.base.id);
        }
        self.stopper.set(StopReason::DaemonDone);
    }

    async fn run_daemon(&self) {
        let mut state = HandlerState::from_scratch(None, Utc::now());
        while !self.stopper.is_set() {
            let outcome = self.invoke_once(&state).await;
            state = state.with_outcome(&outcome, Utc::now());
            if outcome.is_final {
                break;
            }
            let delay = outcome.delay.unwrap_or_else(|| self.handler.base.backoff.unwrap_or(DEFAULT_BACKOFF));
            self.stopper.sleep(delay).await;
        }
    }

    async fn run_timer(&self, interval: Option<Duration>, idle: Option<Duration>, sharp: bool) {
        let started = Instant::now();
        let mut state = HandlerState::from_scratch(None, Utc::now());
        while !self.stopper.is_set() {
            if let Some(idle) = idle {
                loop {
                    let quiet = self.memory.idle_for();
                    if quiet >= idle {
                        break;
                    }
                    if self.stopper.sleep(idle - quiet).await {
                        return;
                    }
                }
            }

            let outcome = self.invoke_once(&state).await;
            if !outcome.is_final {
                state = state.with_outcome(&outcome, Utc::now());
                if let Some(delay) = outcome.delay {
                    self.stopper.sleep(delay).await;
                    continue;
                }
            } else {
                // Every tick gets its own retry budget.
                state = HandlerState::from_scratch(None, Utc::now());
            }
            self.stopper.sleep(next_run_delay(interval, idle, sharp, started.elapsed())).await;
        }
    }

    async fn invoke_once(&self, state: &HandlerState) -> Outcome {
        let env = &self.env;
        let patch = Arc::new(Mutex::new(Patch::new()));
        let ctx = HandlerContext::new(
            self.handler.base.id.clone(),
            env.body.clone(),
            CauseInfo::Spawning,
            env.memo.clone(),
            env.indices.clone(),
        )
        .with_state(state)
        .with_stopper(self.stopper.clone())
        .with_patch(patch.clone())
        .with_guard(self.guard.clone());
        let outcome = execute_handler_once(&self.handler.base, state, ctx, env.default_errors).await;
        let patch = std::mem::take(&mut *lock(&patch));
        if !patch.is_empty() {
            self.apply(&patch).await;
        }
        outcome
    }

    async fn apply(&self, patch: &Patch) {
        let env = &self.env;
        let Some(name) = env.body.name() else { return };
        let namespace = env.body.namespace();
        match env.client.patch(&env.resource, namespace.as_deref(), &name, patch).await {
            Ok(Some(_)) => {}
            Ok(None) => debug!("object gone; daemon patch dropped"),
            Err(e) => warn!(error = %e, "daemon patch failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharp_timers_keep_to_the_grid() {
        let five = Some(Duration::from_secs(5));
        assert_eq!(next_run_delay(five, None, true, Duration::from_millis(300)), Duration::from_millis(4700));
        assert_eq!(next_run_delay(five, None, true, Duration::from_millis(10_300)), Duration::from_millis(4700));
        assert_eq!(next_run_delay(five, None, true, Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(next_run_delay(five, None, false, Duration::from_millis(300)), Duration::from_secs(5));
    }

    #[test]
    fn idle_only_timers_pause_for_the_idle_period() {
        let idle = Some(Duration::from_secs(3));
        assert_eq!(next_run_delay(None, idle, false, Duration::from_secs(7)), Duration::from_secs(3));
    }
}
