//! The multi-cycle execution engine for change handlers.
//!
//! One cycle loads the handlers' progress, picks the due ones through the
//! lifecycle, invokes them one after another, folds the outcomes into new
//! states and writes those states (plus handler results) into the patch.
//! Everything that is not done yet is retried in a later cycle.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use kreact_core::causes::ChangingCause;
use kreact_core::patches::Patch;
use kreact_persist::{ProgressStorage, StorageResult};
use metrics::{counter, histogram};
use tracing::{error, info, info_span, warn, Instrument};

use crate::context::{lock, HandlerContext, Memo};
use crate::errors::{ErrorsMode, HandlerError, HandlerResult};
use crate::handlers::{BaseHandler, ChangingHandler, HandlerFn, HandlerId, DEFAULT_BACKOFF};
use crate::indexing::Indices;
use crate::invocation::invoke;
use crate::lifecycles::Lifecycle;
use crate::outcomes::Outcome;
use crate::states::{HandlerState, State};

/// Everything one changing cycle of one object shares: the cause, the patch
/// being accumulated, and where progress is kept.
pub struct Scope {
    pub cause: Arc<ChangingCause>,
    pub memo: Memo,
    pub indices: Indices,
    pub storage: Arc<dyn ProgressStorage>,
    pub lifecycle: Lifecycle,
    pub default_errors: ErrorsMode,
    pub(crate) patch: Arc<Mutex<Patch>>,
}

impl Scope {
    pub fn new(cause: ChangingCause, memo: Memo, indices: Indices, storage: Arc<dyn ProgressStorage>) -> Self {
        Self {
            cause: Arc::new(cause),
            memo,
            indices,
            storage,
            lifecycle: Lifecycle::default(),
            default_errors: ErrorsMode::default(),
            patch: Arc::new(Mutex::new(Patch::new())),
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_errors(mut self, mode: ErrorsMode) -> Self {
        self.default_errors = mode;
        self
    }

    /// Forget the progress of every handler in `state`; the cause is handled.
    pub fn purge(&self, state: &State) {
        state.purge(&self.cause.body, &mut lock(&self.patch), self.storage.as_ref());
    }

    /// The patch accumulated so far, leaving an empty one behind.
    pub fn take_patch(&self) -> Patch {
        std::mem::take(&mut *lock(&self.patch))
    }
}

fn load_state(scope: &Scope, handlers: &[ChangingHandler]) -> StorageResult<State> {
    State::load(
        &scope.cause.body,
        scope.storage.as_ref(),
        handlers.iter().map(|h| h.base.id.as_str()),
        scope.cause.reason,
        Utc::now(),
    )
}

fn persist(scope: &Scope, state: &State, outcomes: &[(HandlerId, Outcome)]) {
    let mut patch = lock(&scope.patch);
    state.store(&scope.cause.body, &mut patch, scope.storage.as_ref());
    deliver_results(outcomes, &mut patch);
}

/// Store handler results into `status.<handler id>`.
pub fn deliver_results(outcomes: &[(HandlerId, Outcome)], patch: &mut Patch) {
    for (id, outcome) in outcomes {
        if let Some(result) = &outcome.result {
            patch.set(&["status", id.as_str()], result.clone());
        }
    }
}

/// One full cycle over the matching handlers of a cause. The new progress and
/// results land in the scope's patch; the returned state tells what is left.
pub async fn execute_cycle(scope: &Arc<Scope>, handlers: &[ChangingHandler]) -> StorageResult<State> {
    let state = load_state(scope, handlers)?;
    let outcomes = execute_handlers_once(scope, handlers, &state).await;
    let state = state.with_outcomes(&outcomes, Utc::now());
    persist(scope, &state, &outcomes);
    Ok(state)
}

/// Invoke the due handlers selected by the lifecycle, sequentially.
pub async fn execute_handlers_once(
    scope: &Arc<Scope>,
    handlers: &[ChangingHandler],
    state: &State,
) -> Vec<(HandlerId, Outcome)> {
    let now = Utc::now();
    let due: Vec<&ChangingHandler> =
        handlers.iter().filter(|h| state.get(&h.base.id).map_or(true, |s| s.awakened(now))).collect();
    let selected = scope.lifecycle.select(due, |h| state.retries(&h.base.id));

    let mut outcomes = Vec::with_capacity(selected.len());
    for handler in selected {
        let hstate = match state.get(&handler.base.id) {
            Some(s) => s.clone(),
            None => HandlerState::from_scratch(Some(scope.cause.reason), now),
        };
        let ctx = HandlerContext::for_changing(scope.clone(), &handler.base.id, &hstate);
        let span = info_span!("handler", handler = %handler.base.id, reason = %scope.cause.reason);
        let outcome = execute_handler_once(&handler.base, &hstate, ctx, scope.default_errors).instrument(span).await;
        outcomes.push((handler.base.id.clone(), outcome));
    }
    outcomes
}

async fn run_with_children(func: &HandlerFn, ctx: HandlerContext) -> HandlerResult {
    let result = invoke(func, ctx.clone()).await?;
    ctx.execute_registered().await?;
    Ok(result)
}

/// Invoke one handler once and turn whatever happens into an outcome.
///
/// Shared by change handlers and the daemon/timer runners.
pub async fn execute_handler_once(
    base: &BaseHandler,
    state: &HandlerState,
    ctx: HandlerContext,
    default_errors: ErrorsMode,
) -> Outcome {
    let runtime = state.runtime(Utc::now());

    if let Some(timeout) = base.timeout {
        if runtime >= timeout {
            error!("{base} has timed out after {:?}", runtime);
            counter!("execution_handler_outcomes_total", 1u64, "outcome" => "timeout");
            return Outcome::failure(HandlerError::Timeout(timeout));
        }
    }
    if let Some(limit) = base.retries {
        if state.retries > limit {
            error!("{base} has exceeded {limit} retries");
            counter!("execution_handler_outcomes_total", 1u64, "outcome" => "retries_exceeded");
            return Outcome::failure(HandlerError::RetriesExceeded(limit));
        }
    }

    counter!("execution_handler_invocations_total", 1u64);
    let t0 = std::time::Instant::now();
    // The timeout is only checked between invocations: a running handler,
    // blocking ones included, is always awaited to completion.
    let result = run_with_children(&base.func, ctx.clone()).await;
    histogram!("execution_handler_ms", t0.elapsed().as_secs_f64() * 1000.0);
    let subrefs = ctx.take_subrefs();

    let outcome = match result {
        Ok(result) => {
            info!("{base} succeeded");
            Outcome::success(result)
        }
        Err(err) => {
            let requested = match &err {
                HandlerError::Temporary { delay, .. } | HandlerError::ChildrenPending { delay } => Some(*delay),
                _ => None,
            };
            if let Some(delay) = requested {
                if matches!(err, HandlerError::ChildrenPending { .. }) {
                    info!("{base} is waiting for its sub-handlers");
                } else {
                    warn!("{base} failed temporarily: {err}");
                }
                Outcome::retry(err, delay)
            } else if err.is_fatal() {
                error!("{base} failed permanently: {err}");
                Outcome::failure(err)
            } else {
                match base.errors.unwrap_or(default_errors) {
                    ErrorsMode::Ignored => {
                        warn!("{base} failed with an error; ignored: {err:#}");
                        Outcome::success(None)
                    }
                    ErrorsMode::Temporary => {
                        let backoff = base.backoff.unwrap_or(DEFAULT_BACKOFF);
                        warn!("{base} failed with an error; will retry in {backoff:?}: {err:#}");
                        Outcome::retry(err, Some(backoff))
                    }
                    ErrorsMode::Permanent => {
                        error!("{base} failed with an error; will stop: {err:#}");
                        Outcome::failure(err)
                    }
                }
            }
        }
    };

    let label = if outcome.is_success() {
        "success"
    } else if outcome.is_failure() {
        "failure"
    } else {
        "retry"
    };
    counter!("execution_handler_outcomes_total", 1u64, "outcome" => label);
    outcome.with_subrefs(subrefs)
}

/// Run sub-handlers of `parent_id` with their own nested progress.
///
/// Boxed: sub-handlers may register sub-handlers of their own.
pub(crate) fn execute_subhandlers(
    scope: Arc<Scope>,
    parent_id: HandlerId,
    handlers: Vec<ChangingHandler>,
    subrefs: Arc<Mutex<BTreeSet<HandlerId>>>,
) -> BoxFuture<'static, Result<(), HandlerError>> {
    async move {
        let handlers: Vec<ChangingHandler> = handlers
            .into_iter()
            .map(|mut h| {
                h.base.id = format!("{parent_id}/{}", h.base.id);
                h
            })
            .collect();
        let ids: BTreeSet<&str> = handlers.iter().map(|h| h.base.id.as_str()).collect();
        if ids.len() != handlers.len() {
            return Err(HandlerError::permanent(format!("duplicate sub-handler ids under {parent_id}")));
        }

        let state = execute_cycle(&scope, &handlers).await.map_err(|e| HandlerError::Other(e.into()))?;
        {
            let mut refs = lock(&subrefs);
            refs.extend(handlers.iter().map(|h| h.base.id.clone()));
            for (_, s) in state.iter() {
                refs.extend(s.subrefs.iter().cloned());
            }
        }
        if state.done() {
            Ok(())
        } else {
            Err(HandlerError::ChildrenPending { delay: state.delays(Utc::now()).into_iter().min() })
        }
    }
    .boxed()
}
