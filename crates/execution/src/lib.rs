//! kreact execution: handler registrations and the engine that runs them.
//!
//! Change handlers are retried across cycles until each of them either
//! succeeds or fails for good; their progress lives in the object itself (see
//! `kreact-persist`). Watching and indexing handlers are fire-and-forget, and
//! spawning handlers (daemons, timers) are run by `kreact-daemons`.

#![forbid(unsafe_code)]

pub mod context;
pub mod engine;
pub mod errors;
pub mod filters;
pub mod handlers;
pub mod indexing;
pub mod invocation;
pub mod lifecycles;
pub mod outcomes;
pub mod registry;
pub mod states;
pub mod stoppers;

pub use context::{CauseInfo, HandlerContext, Memo};
pub use engine::{execute_cycle, execute_handler_once, execute_handlers_once, Scope};
pub use errors::{ErrorsMode, HandlerError, HandlerResult};
pub use filters::{Filters, MetaFilter, ValueFilter};
pub use handlers::{
    BaseHandler, ChangingHandler, Handler, HandlerFn, HandlerId, HandlerOptions, IndexingHandler, SpawningHandler,
    SpawningKind, WatchingHandler, DEFAULT_BACKOFF,
};
pub use indexing::Indices;
pub use invocation::invoke;
pub use lifecycles::Lifecycle;
pub use outcomes::Outcome;
pub use registry::{Registry, RegistryError};
pub use states::{HandlerState, State};
pub use stoppers::{DaemonStopper, StopReason};
