//! Stopping: signal, then cancel, then abandon.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::future::join_all;
use kreact_execution::{HandlerId, SpawningHandler, SpawningKind, StopReason};
use metrics::counter;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::memory::{Daemon, DaemonsMemory};
use crate::DaemonSettings;

/// How a stopped task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own after the signal.
    Exited,
    /// Exited after being cancelled.
    Cancelled,
    /// Still running after the cancellation timeout; no longer tracked.
    Abandoned,
}

fn cancellation(handler: &SpawningHandler, settings: &DaemonSettings) -> (Option<Duration>, Option<Duration>) {
    match &handler.kind {
        SpawningKind::Daemon { cancellation_backoff, cancellation_timeout } => (
            cancellation_backoff.or(settings.cancellation_backoff),
            cancellation_timeout.or(settings.cancellation_timeout),
        ),
        // Timers are only ever between runs or inside one; cancel right away.
        SpawningKind::Timer { .. } => (None, settings.cancellation_timeout),
    }
}

/// Wait for `finished`, at most `limit` (forever if `None`), unless forced.
async fn wait_finished(finished: &CancellationToken, limit: Option<Duration>, forced: &CancellationToken) -> bool {
    let limit = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        biased;
        _ = finished.cancelled() => true,
        _ = forced.cancelled() => finished.is_cancelled(),
        _ = limit => false,
    }
}

/// Walk one signalled daemon down the ladder until it is gone or abandoned.
async fn terminate(
    memory: DaemonsMemory,
    daemon: Daemon,
    settings: DaemonSettings,
    forced: CancellationToken,
) -> Termination {
    for _ in 0..settings.instant_exit_zero_time_cycles {
        if daemon.is_finished() {
            break;
        }
        tokio::task::yield_now().await;
    }
    let (backoff, timeout) = cancellation(&daemon.handler, &settings);
    if daemon.is_finished() || (backoff.is_some() && wait_finished(&daemon.finished, backoff, &forced).await) {
        counter!("daemons_stopped_total", 1u64, "how" => "exited");
        memory.reap();
        return Termination::Exited;
    }

    warn!(parent: &daemon.span, "daemon did not exit in time; cancelling");
    daemon.stopper.set(StopReason::DaemonCancelled);
    daemon.abort.abort();
    if wait_finished(&daemon.finished, timeout, &forced).await {
        counter!("daemons_stopped_total", 1u64, "how" => "cancelled");
        memory.reap();
        Termination::Cancelled
    } else {
        warn!(parent: &daemon.span, ?timeout, "daemon did not finish after cancellation; abandoning");
        counter!("daemons_abandoned_total", 1u64);
        memory.forget(daemon.id(), daemon.serial);
        Termination::Abandoned
    }
}

/// Time until the next rung of a stopping daemon's ladder.
fn next_check(daemon: &Daemon, settings: &DaemonSettings, now: Instant) -> Duration {
    let since = daemon.stop_started.map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
    let (backoff, timeout) = cancellation(&daemon.handler, settings);
    let backoff = backoff.unwrap_or(Duration::ZERO);
    if since < backoff {
        return backoff - since;
    }
    match timeout {
        Some(timeout) if since < backoff + timeout => backoff + timeout - since,
        _ => settings.stop_recheck,
    }
}

/// Signal the selected daemons and give them a few zero-time turns to exit.
/// Those still running continue down the ladder in the background; the
/// returned delays say when to look at the object again.
async fn stop_selected(
    memory: &DaemonsMemory,
    reason: StopReason,
    settings: &DaemonSettings,
    selected: impl Fn(&str) -> bool,
) -> Vec<Duration> {
    memory.reap();
    let now = Instant::now();
    let (targets, fresh): (Vec<Daemon>, Vec<Daemon>) = memory.with_running(|running| {
        let mut targets = Vec::new();
        let mut fresh = Vec::new();
        for daemon in running.values_mut().filter(|d| selected(d.id())) {
            daemon.stopper.set(reason);
            if daemon.stop_started.is_none() {
                daemon.stop_started = Some(now);
                fresh.push(daemon.clone());
            }
            targets.push(daemon.clone());
        }
        (targets, fresh)
    });
    if targets.is_empty() {
        return Vec::new();
    }
    for daemon in &fresh {
        debug!(parent: &daemon.span, ?reason, "stopping the daemon");
    }

    for _ in 0..settings.instant_exit_zero_time_cycles {
        if targets.iter().all(Daemon::is_finished) {
            break;
        }
        tokio::task::yield_now().await;
    }
    for daemon in fresh.into_iter().filter(|d| !d.is_finished()) {
        tokio::spawn(terminate(memory.clone(), daemon, settings.clone(), CancellationToken::new()));
    }
    memory.reap();
    let now = Instant::now();
    targets.iter().filter(|d| !d.is_finished()).map(|d| next_check(d, settings, now)).collect()
}

/// Stop every daemon of the object, e.g. when it is being deleted.
pub async fn stop_daemons(memory: &DaemonsMemory, reason: StopReason, settings: &DaemonSettings) -> Vec<Duration> {
    stop_selected(memory, reason, settings, |_| true).await
}

/// Stop the daemons whose handlers no longer match the object.
pub async fn match_daemons(
    memory: &DaemonsMemory,
    matching: &[&SpawningHandler],
    settings: &DaemonSettings,
) -> Vec<Duration> {
    let keep: BTreeSet<&str> = matching.iter().map(|h| h.base.id.as_str()).collect();
    stop_selected(memory, StopReason::FiltersMismatch, settings, |id| !keep.contains(id)).await
}

/// Operator exit: stop everything everywhere and wait for the ladders to end.
/// Once `forced` fires, nobody is waited for any longer.
pub async fn stop_all_daemons(
    memories: impl IntoIterator<Item = DaemonsMemory>,
    settings: &DaemonSettings,
    forced: &CancellationToken,
) -> Vec<(HandlerId, Termination)> {
    let mut ladders = Vec::new();
    for memory in memories {
        for daemon in memory.daemons() {
            daemon.stopper.set(StopReason::OperatorExiting);
            let id = daemon.id().to_string();
            let ladder = terminate(memory.clone(), daemon, settings.clone(), forced.clone());
            ladders.push(async move { (id, ladder.await) });
        }
    }
    join_all(ladders).await
}
