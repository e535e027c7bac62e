//! The explicit invocation context every handler receives.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kreact_core::bodies::{Body, EventType};
use kreact_core::causes::{ChangingCause, Reason};
use kreact_core::diffs::Diff;
use kreact_core::patches::Patch;
use serde_json::{Map, Value};
use tokio_util::sync::DropGuard;

use crate::engine::{execute_subhandlers, Scope};
use crate::errors::HandlerError;
use crate::handlers::{ChangingHandler, HandlerId};
use crate::indexing::Indices;
use crate::states::HandlerState;
use crate::stoppers::DaemonStopper;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Arbitrary per-object data kept by the operator between cycles; shared by
/// every handler, daemon and timer of that object.
#[derive(Debug, Clone, Default)]
pub struct Memo {
    inner: Arc<Mutex<Map<String, Value>>>,
}

impl Memo {
    pub fn get(&self, key: &str) -> Option<Value> {
        lock(&self.inner).get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Value) {
        lock(&self.inner).insert(key.to_string(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        lock(&self.inner).remove(key)
    }
}

/// Why the handler is invoked.
#[derive(Debug, Clone)]
pub enum CauseInfo {
    Changing(Arc<ChangingCause>),
    Watching(Option<EventType>),
    Spawning,
    Indexing,
}

#[derive(Clone)]
pub struct HandlerContext {
    pub handler_id: HandlerId,
    /// Live view: daemons see every fresher state of the object.
    pub body: Body,
    pub cause: CauseInfo,
    /// Attempts made before this one.
    pub retry: u32,
    pub started: DateTime<Utc>,
    pub runtime: Duration,
    pub memo: Memo,
    pub indices: Indices,
    /// Set for daemons and timers.
    pub stopper: Option<DaemonStopper>,
    patch: Arc<Mutex<Patch>>,
    scope: Option<Arc<Scope>>,
    subhandlers: Arc<Mutex<Vec<ChangingHandler>>>,
    subrefs: Arc<Mutex<BTreeSet<HandlerId>>>,
    _guard: Option<Arc<DropGuard>>,
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("handler_id", &self.handler_id)
            .field("cause", &self.cause)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl HandlerContext {
    pub fn new(handler_id: impl Into<HandlerId>, body: Body, cause: CauseInfo, memo: Memo, indices: Indices) -> Self {
        Self {
            handler_id: handler_id.into(),
            body,
            cause,
            retry: 0,
            started: Utc::now(),
            runtime: Duration::ZERO,
            memo,
            indices,
            stopper: None,
            patch: Arc::new(Mutex::new(Patch::new())),
            scope: None,
            subhandlers: Arc::default(),
            subrefs: Arc::default(),
            _guard: None,
        }
    }

    pub(crate) fn for_changing(scope: Arc<Scope>, handler_id: &str, state: &HandlerState) -> Self {
        let mut ctx = Self::new(
            handler_id,
            scope.cause.body.clone(),
            CauseInfo::Changing(scope.cause.clone()),
            scope.memo.clone(),
            scope.indices.clone(),
        )
        .with_state(state);
        ctx.patch = scope.patch.clone();
        ctx.scope = Some(scope);
        ctx
    }

    pub fn with_state(mut self, state: &HandlerState) -> Self {
        let now = Utc::now();
        self.retry = state.retries;
        self.started = state.started;
        self.runtime = state.runtime(now);
        self
    }

    pub fn with_stopper(mut self, stopper: DaemonStopper) -> Self {
        self.stopper = Some(stopper);
        self
    }

    /// Keep `guard` alive for as long as any clone of this context lives,
    /// including inside a blocking handler that outlived its caller.
    pub fn with_guard(mut self, guard: Arc<DropGuard>) -> Self {
        self._guard = Some(guard);
        self
    }

    /// Share a patch accumulator with the caller.
    pub fn with_patch(mut self, patch: Arc<Mutex<Patch>>) -> Self {
        self.patch = patch;
        self
    }

    pub fn reason(&self) -> Option<Reason> {
        match &self.cause {
            CauseInfo::Changing(c) => Some(c.reason),
            _ => None,
        }
    }

    pub fn diff(&self) -> Option<&Diff> {
        match &self.cause {
            CauseInfo::Changing(c) => Some(&c.diff),
            _ => None,
        }
    }

    pub fn old(&self) -> Option<&Value> {
        match &self.cause {
            CauseInfo::Changing(c) => c.old.as_ref(),
            _ => None,
        }
    }

    pub fn new_essence(&self) -> Option<&Value> {
        match &self.cause {
            CauseInfo::Changing(c) => c.new.as_ref(),
            _ => None,
        }
    }

    pub fn initial(&self) -> bool {
        matches!(&self.cause, CauseInfo::Changing(c) if c.initial)
    }

    pub fn event_type(&self) -> Option<EventType> {
        match &self.cause {
            CauseInfo::Watching(t) => *t,
            _ => None,
        }
    }

    /// Modify the patch applied to the object at the end of the cycle.
    pub fn patch<R>(&self, f: impl FnOnce(&mut Patch) -> R) -> R {
        f(&mut lock(&self.patch))
    }

    /// Whether the daemon or timer was asked to stop.
    pub fn is_stopping(&self) -> bool {
        self.stopper.as_ref().map_or(false, DaemonStopper::is_set)
    }

    /// Register a sub-handler; it runs, with its own progress, once this
    /// handler returns successfully. Its id becomes `<this id>/<its id>`.
    pub fn register_subhandler(&self, handler: ChangingHandler) -> Result<(), HandlerError> {
        if self.scope.is_none() {
            return Err(HandlerError::permanent("sub-handlers are only available in change handlers"));
        }
        lock(&self.subhandlers).push(handler);
        Ok(())
    }

    /// Run sub-handlers right now instead of after this handler returns.
    ///
    /// Returns [`HandlerError::ChildrenPending`] if some are not done yet;
    /// propagate it with `?` so this handler is retried.
    pub async fn execute(&self, handlers: Vec<ChangingHandler>) -> Result<(), HandlerError> {
        let Some(scope) = self.scope.clone() else {
            return Err(HandlerError::permanent("sub-handlers are only available in change handlers"));
        };
        execute_subhandlers(scope, self.handler_id.clone(), handlers, self.subrefs.clone()).await
    }

    /// Run what was registered through [`register_subhandler`](Self::register_subhandler).
    pub(crate) async fn execute_registered(&self) -> Result<(), HandlerError> {
        let registered = std::mem::take(&mut *lock(&self.subhandlers));
        if registered.is_empty() {
            return Ok(());
        }
        self.execute(registered).await
    }

    pub(crate) fn take_subrefs(&self) -> Vec<HandlerId> {
        std::mem::take(&mut *lock(&self.subrefs)).into_iter().collect()
    }
}
