//! Handler registrations: a shared base record plus one closed set of kinds.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use kreact_core::bodies::Body;
use kreact_core::causes::{ChangingCause, Reason};
use kreact_core::diffs::{field_path, FieldPath};
use serde_json::Value;

use crate::context::HandlerContext;
use crate::errors::{ErrorsMode, HandlerResult};
use crate::filters::{Filters, MetaFilter, ValueFilter};

/// Retry delay for arbitrary errors when the handler does not set one.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(60);

pub type HandlerId = String;

pub type AsyncHandlerFn = Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
pub type SyncHandlerFn = Arc<dyn Fn(HandlerContext) -> HandlerResult + Send + Sync>;

/// The user's callable. Synchronous ones run on the blocking pool.
#[derive(Clone)]
pub enum HandlerFn {
    Async(AsyncHandlerFn),
    Sync(SyncHandlerFn),
}

impl HandlerFn {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        HandlerFn::Async(Arc::new(move |ctx| f(ctx).boxed()))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(HandlerContext) -> HandlerResult + Send + Sync + 'static,
    {
        HandlerFn::Sync(Arc::new(f))
    }
}

impl fmt::Debug for HandlerFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerFn::Async(_) => f.write_str("HandlerFn::Async"),
            HandlerFn::Sync(_) => f.write_str("HandlerFn::Sync"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BaseHandler {
    pub id: HandlerId,
    pub func: HandlerFn,
    pub filters: Filters,
    /// `None` falls back to the operator-wide default.
    pub errors: Option<ErrorsMode>,
    /// Total time across all attempts, measured from the first one.
    pub timeout: Option<Duration>,
    /// Retries allowed after the first attempt.
    pub retries: Option<u32>,
    pub backoff: Option<Duration>,
}

impl BaseHandler {
    pub fn new(id: impl Into<HandlerId>, func: HandlerFn) -> Self {
        Self {
            id: id.into(),
            func,
            filters: Filters::default(),
            errors: None,
            timeout: None,
            retries: None,
            backoff: None,
        }
    }
}

impl fmt::Display for BaseHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler '{}'", self.id)
    }
}

/// Builder-style options shared by every kind.
pub trait HandlerOptions: Sized {
    fn base_mut(&mut self) -> &mut BaseHandler;

    fn timeout(mut self, timeout: Duration) -> Self {
        self.base_mut().timeout = Some(timeout);
        self
    }

    fn retries(mut self, retries: u32) -> Self {
        self.base_mut().retries = Some(retries);
        self
    }

    fn backoff(mut self, backoff: Duration) -> Self {
        self.base_mut().backoff = Some(backoff);
        self
    }

    fn errors(mut self, mode: ErrorsMode) -> Self {
        self.base_mut().errors = Some(mode);
        self
    }

    fn label(mut self, key: &str, filter: MetaFilter) -> Self {
        self.base_mut().filters.labels.push((key.to_string(), filter));
        self
    }

    fn annotation(mut self, key: &str, filter: MetaFilter) -> Self {
        self.base_mut().filters.annotations.push((key.to_string(), filter));
        self
    }

    fn value(mut self, field: &str, filter: ValueFilter) -> Self {
        self.base_mut().filters.value = Some((field_path(field), filter));
        self
    }

    fn when<F>(mut self, f: F) -> Self
    where
        F: Fn(&Body) -> bool + Send + Sync + 'static,
    {
        self.base_mut().filters.when = Some(Arc::new(f));
        self
    }
}

/// Cause-driven, stateful handlers: creation, update, deletion, resuming, fields.
#[derive(Debug, Clone)]
pub struct ChangingHandler {
    pub base: BaseHandler,
    /// `None` means any handled reason except deletion.
    pub reasons: Option<Vec<Reason>>,
    /// Only in the first cycle after the operator started.
    pub initial: bool,
    /// Only when this field has changed (for creation and update causes).
    pub field: Option<FieldPath>,
    pub old: Option<ValueFilter>,
    pub new: Option<ValueFilter>,
    /// Keep the object from being deleted until this handler is done.
    pub requires_finalizer: bool,
}

impl ChangingHandler {
    pub fn new(id: impl Into<HandlerId>, reasons: Option<Vec<Reason>>, func: HandlerFn) -> Self {
        Self {
            base: BaseHandler::new(id, func),
            reasons,
            initial: false,
            field: None,
            old: None,
            new: None,
            requires_finalizer: false,
        }
    }

    pub fn on_create(id: impl Into<HandlerId>, func: HandlerFn) -> Self {
        Self::new(id, Some(vec![Reason::Create]), func)
    }

    pub fn on_update(id: impl Into<HandlerId>, func: HandlerFn) -> Self {
        Self::new(id, Some(vec![Reason::Update]), func)
    }

    pub fn on_delete(id: impl Into<HandlerId>, func: HandlerFn) -> Self {
        Self { requires_finalizer: true, ..Self::new(id, Some(vec![Reason::Delete]), func) }
    }

    /// Every first cycle after a restart, unless the object is being deleted.
    pub fn on_resume(id: impl Into<HandlerId>, func: HandlerFn) -> Self {
        Self { initial: true, ..Self::new(id, None, func) }
    }

    pub fn on_field(id: impl Into<HandlerId>, field: &str, func: HandlerFn) -> Self {
        Self { field: Some(field_path(field)), ..Self::new(id, None, func) }
    }

    /// A sub-handler, registered from within a running handler.
    pub fn subhandler(id: impl Into<HandlerId>, func: HandlerFn) -> Self {
        Self::new(id, None, func)
    }

    /// Deletion handlers run only if the object happens to be around; they do
    /// not hold it with a finalizer.
    pub fn optional(mut self) -> Self {
        self.requires_finalizer = false;
        self
    }

    pub fn field(mut self, field: &str) -> Self {
        self.field = Some(field_path(field));
        self
    }

    pub fn old_value(mut self, filter: ValueFilter) -> Self {
        self.old = Some(filter);
        self
    }

    pub fn new_value(mut self, filter: ValueFilter) -> Self {
        self.new = Some(filter);
        self
    }

    pub fn is_deletion_handler(&self) -> bool {
        self.reasons.as_ref().map_or(false, |r| r.contains(&Reason::Delete))
    }

    fn matches_reason(&self, reason: Reason) -> bool {
        match &self.reasons {
            Some(reasons) => reasons.contains(&reason),
            None => reason.is_handled() && reason != Reason::Delete,
        }
    }

    /// Whether this handler applies to the cause: reason, first-cycle flag,
    /// field change, old/new values and the object filters.
    pub fn matches(&self, cause: &ChangingCause) -> bool {
        if !self.matches_reason(cause.reason) || (self.initial && !cause.initial) {
            return false;
        }
        if let Some(field) = &self.field {
            if matches!(cause.reason, Reason::Create | Reason::Update) && cause.diff.reduce(field).is_empty() {
                return false;
            }
        }
        let pick = |doc: &Option<Value>| -> Option<Value> {
            let doc = doc.as_ref()?;
            match &self.field {
                Some(path) => path.iter().try_fold(doc, |cur, p| cur.get(p.as_str())).cloned(),
                None => Some(doc.clone()),
            }
        };
        if let Some(f) = &self.old {
            if !f.matches(pick(&cause.old).as_ref()) {
                return false;
            }
        }
        if let Some(f) = &self.new {
            if !f.matches(pick(&cause.new).as_ref()) {
                return false;
            }
        }
        self.base.filters.matches(&cause.body)
    }
}

/// Fire-and-forget handlers for every event, errors logged and ignored.
#[derive(Debug, Clone)]
pub struct WatchingHandler {
    pub base: BaseHandler,
}

impl WatchingHandler {
    pub fn new(id: impl Into<HandlerId>, func: HandlerFn) -> Self {
        Self { base: BaseHandler::new(id, func) }
    }
}

/// Handlers whose results are kept in in-memory indices across all objects.
#[derive(Debug, Clone)]
pub struct IndexingHandler {
    pub base: BaseHandler,
}

impl IndexingHandler {
    pub fn new(id: impl Into<HandlerId>, func: HandlerFn) -> Self {
        Self { base: BaseHandler::new(id, func) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpawningKind {
    /// Runs the body until it exits or is stopped.
    Daemon {
        /// Grace period after the stop signal before cancelling.
        cancellation_backoff: Option<Duration>,
        /// How long to wait for the cancelled task before abandoning it.
        cancellation_timeout: Option<Duration>,
    },
    /// Re-runs the body on a schedule.
    Timer {
        interval: Option<Duration>,
        /// Run only once the object has not changed for this long.
        idle: Option<Duration>,
        /// Align runs to the grid of `interval` since the timer started.
        sharp: bool,
    },
}

/// Daemons and timers: one background task per (object, handler).
#[derive(Debug, Clone)]
pub struct SpawningHandler {
    pub base: BaseHandler,
    pub kind: SpawningKind,
    pub initial_delay: Option<Duration>,
    pub requires_finalizer: bool,
}

impl SpawningHandler {
    pub fn daemon(id: impl Into<HandlerId>, func: HandlerFn) -> Self {
        Self {
            base: BaseHandler::new(id, func),
            kind: SpawningKind::Daemon { cancellation_backoff: None, cancellation_timeout: None },
            initial_delay: None,
            requires_finalizer: true,
        }
    }

    pub fn timer(id: impl Into<HandlerId>, interval: Duration, func: HandlerFn) -> Self {
        Self {
            base: BaseHandler::new(id, func),
            kind: SpawningKind::Timer { interval: Some(interval), idle: None, sharp: false },
            initial_delay: None,
            requires_finalizer: true,
        }
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    pub fn optional(mut self) -> Self {
        self.requires_finalizer = false;
        self
    }

    pub fn cancellation(mut self, backoff: Option<Duration>, timeout: Option<Duration>) -> Self {
        if let SpawningKind::Daemon { cancellation_backoff, cancellation_timeout } = &mut self.kind {
            *cancellation_backoff = backoff;
            *cancellation_timeout = timeout;
        }
        self
    }

    pub fn idle(mut self, delay: Duration) -> Self {
        if let SpawningKind::Timer { idle, .. } = &mut self.kind {
            *idle = Some(delay);
        }
        self
    }

    pub fn sharp(mut self) -> Self {
        if let SpawningKind::Timer { sharp, .. } = &mut self.kind {
            *sharp = true;
        }
        self
    }
}

impl HandlerOptions for ChangingHandler {
    fn base_mut(&mut self) -> &mut BaseHandler {
        &mut self.base
    }
}

impl HandlerOptions for WatchingHandler {
    fn base_mut(&mut self) -> &mut BaseHandler {
        &mut self.base
    }
}

impl HandlerOptions for IndexingHandler {
    fn base_mut(&mut self) -> &mut BaseHandler {
        &mut self.base
    }
}

impl HandlerOptions for SpawningHandler {
    fn base_mut(&mut self) -> &mut BaseHandler {
        &mut self.base
    }
}

/// Every kind of registration; the set is closed.
#[derive(Debug, Clone)]
pub enum Handler {
    Indexing(IndexingHandler),
    Watching(WatchingHandler),
    Changing(ChangingHandler),
    Spawning(SpawningHandler),
}

impl Handler {
    pub fn base(&self) -> &BaseHandler {
        match self {
            Handler::Indexing(h) => &h.base,
            Handler::Watching(h) => &h.base,
            Handler::Changing(h) => &h.base,
            Handler::Spawning(h) => &h.base,
        }
    }

    pub fn id(&self) -> &str {
        &self.base().id
    }
}

impl From<IndexingHandler> for Handler {
    fn from(h: IndexingHandler) -> Self {
        Handler::Indexing(h)
    }
}

impl From<WatchingHandler> for Handler {
    fn from(h: WatchingHandler) -> Self {
        Handler::Watching(h)
    }
}

impl From<ChangingHandler> for Handler {
    fn from(h: ChangingHandler) -> Self {
        Handler::Changing(h)
    }
}

impl From<SpawningHandler> for Handler {
    fn from(h: SpawningHandler) -> Self {
        Handler::Spawning(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kreact_core::causes::detect_changing_cause;
    use serde_json::json;

    fn noop() -> HandlerFn {
        HandlerFn::new(|_ctx| async { Ok(None) })
    }

    fn cause(old: Option<Value>, new: Value, initial: bool) -> ChangingCause {
        let body = Body::new(new.clone());
        detect_changing_cause(None, &body, old, Some(new), "kreact.dev/finalizer", initial)
    }

    #[test]
    fn reasons_and_initial_flag() {
        let created = cause(None, json!({"spec": {"a": 1}}), false);
        assert!(ChangingHandler::on_create("c", noop()).matches(&created));
        assert!(!ChangingHandler::on_update("u", noop()).matches(&created));
        assert!(!ChangingHandler::on_resume("r", noop()).matches(&created));

        let resumed = cause(Some(json!({"spec": {"a": 1}})), json!({"spec": {"a": 1}}), true);
        assert_eq!(resumed.reason, Reason::Resume);
        assert!(ChangingHandler::on_resume("r", noop()).matches(&resumed));
    }

    #[test]
    fn field_handlers_need_a_change_in_their_field() {
        let updated = cause(Some(json!({"spec": {"a": 1, "b": 1}})), json!({"spec": {"a": 2, "b": 1}}), false);
        assert!(ChangingHandler::on_field("a", "spec.a", noop()).matches(&updated));
        assert!(!ChangingHandler::on_field("b", "spec.b", noop()).matches(&updated));
        let to_two = ChangingHandler::on_field("a2", "spec.a", noop()).new_value(ValueFilter::Equals(json!(2)));
        assert!(to_two.matches(&updated));
        let from_two = ChangingHandler::on_field("a3", "spec.a", noop()).old_value(ValueFilter::Equals(json!(2)));
        assert!(!from_two.matches(&updated));
    }

    #[test]
    fn deletion_handlers_hold_the_object_unless_optional() {
        assert!(ChangingHandler::on_delete("d", noop()).requires_finalizer);
        assert!(!ChangingHandler::on_delete("d", noop()).optional().requires_finalizer);
        assert!(ChangingHandler::on_delete("d", noop()).is_deletion_handler());
    }

    #[test]
    fn options_apply_to_the_base() {
        let h = SpawningHandler::timer("t", Duration::from_secs(5), noop())
            .sharp()
            .retries(3)
            .label("app", MetaFilter::Present);
        assert_eq!(h.base.retries, Some(3));
        assert_eq!(h.kind, SpawningKind::Timer { interval: Some(Duration::from_secs(5)), idle: None, sharp: true });
        assert_eq!(Handler::from(h).id(), "t");
    }
}
