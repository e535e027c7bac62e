use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use kreact_execution::{DaemonStopper, HandlerId, SpawningHandler};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument, Span};

use crate::runners::Runner;
use crate::DaemonEnv;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// A running daemon or timer as seen from the outside.
#[derive(Debug, Clone)]
pub struct Daemon {
    pub handler: SpawningHandler,
    pub stopper: DaemonStopper,
    /// Fires once the task and every handler body it started are gone.
    pub finished: CancellationToken,
    pub(crate) serial: u64,
    pub(crate) abort: AbortHandle,
    pub(crate) stop_started: Option<Instant>,
    pub(crate) span: Span,
}

impl Daemon {
    pub fn id(&self) -> &str {
        &self.handler.base.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }
}

/// Background-task bookkeeping of one object. Clones share the state.
#[derive(Debug, Clone)]
pub struct DaemonsMemory {
    running: Arc<Mutex<FxHashMap<HandlerId, Daemon>>>,
    forever_stopped: Arc<Mutex<BTreeSet<HandlerId>>>,
    idle_reset: Arc<Mutex<Instant>>,
    serials: Arc<AtomicU64>,
}

impl Default for DaemonsMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonsMemory {
    pub fn new() -> Self {
        Self {
            running: Arc::default(),
            forever_stopped: Arc::default(),
            idle_reset: Arc::new(Mutex::new(Instant::now())),
            serials: Arc::default(),
        }
    }

    /// The object has changed: idle timers start counting again.
    pub fn touch(&self) {
        *lock(&self.idle_reset) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.idle_reset).elapsed()
    }

    pub fn is_forever_stopped(&self, id: &str) -> bool {
        lock(&self.forever_stopped).contains(id)
    }

    pub(crate) fn stop_forever(&self, id: &str) {
        lock(&self.forever_stopped).insert(id.to_string());
    }

    /// Drop the records of tasks that are fully gone.
    pub fn reap(&self) {
        let mut running = lock(&self.running);
        running.retain(|_, d| !d.is_finished());
        gauge!("daemons_running", running.len() as f64);
    }

    pub fn running_ids(&self) -> Vec<HandlerId> {
        self.reap();
        let mut ids: Vec<HandlerId> = lock(&self.running).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// No live tasks remain; the object may be forgotten.
    pub fn is_empty(&self) -> bool {
        self.reap();
        lock(&self.running).is_empty()
    }

    pub(crate) fn daemons(&self) -> Vec<Daemon> {
        lock(&self.running).values().cloned().collect()
    }

    pub(crate) fn with_running<R>(&self, f: impl FnOnce(&mut FxHashMap<HandlerId, Daemon>) -> R) -> R {
        f(&mut lock(&self.running))
    }

    /// Stop tracking one particular instance; a newer one under the same id stays.
    pub(crate) fn forget(&self, id: &str, serial: u64) {
        let mut running = lock(&self.running);
        if running.get(id).map_or(false, |d| d.serial == serial) {
            running.remove(id);
        }
    }
}

/// Start the handlers that are neither running nor stopped for good.
pub fn spawn_daemons<'a>(
    memory: &DaemonsMemory,
    handlers: impl IntoIterator<Item = &'a SpawningHandler>,
    env: &DaemonEnv,
) {
    memory.reap();
    for handler in handlers {
        let id = handler.base.id.clone();
        if memory.is_forever_stopped(&id) {
            continue;
        }
        memory.with_running(|running| {
            if running.contains_key(&id) {
                return;
            }
            let stopper = DaemonStopper::new();
            let finished = CancellationToken::new();
            let guard = Arc::new(finished.clone().drop_guard());
            let span = info_span!("daemon", handler = %id, object = %env.body.key());
            let runner = Runner {
                handler: handler.clone(),
                env: env.clone(),
                stopper: stopper.clone(),
                memory: memory.clone(),
                guard,
            };
            let task = tokio::spawn(runner.run().instrument(span.clone()));
            span.in_scope(|| info!("daemon started"));
            counter!("daemons_spawned_total", 1u64);
            let serial = memory.serials.fetch_add(1, Ordering::Relaxed);
            running.insert(
                id,
                Daemon {
                    handler: handler.clone(),
                    stopper,
                    finished,
                    serial,
                    abort: task.abort_handle(),
                    stop_started: None,
                    span,
                },
            );
        });
    }
}
