//! kreact daemons: long-running and periodic background tasks tied to objects.
//!
//! Each (object, spawning handler) pair gets at most one live task. The object's
//! worker decides when tasks start and stop; the tasks themselves only read the
//! object's live body and patch it through the client.
//!
//! ```text
//! not started ─► running ─► signalled ─► cancelled ─► abandoned
//!                   │           │            │
//!                   └───────────┴────────────┴──────► done
//! ```

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kreact_core::bodies::Body;
use kreact_core::resources::Resource;
use kreact_execution::{ErrorsMode, Indices, Memo};
use kreact_kubehub::ApiClient;

mod ladder;
mod memory;
mod runners;

pub use kreact_execution::stoppers::{DaemonStopper, StopReason};
pub use ladder::{match_daemons, stop_all_daemons, stop_daemons, Termination};
pub use memory::{spawn_daemons, Daemon, DaemonsMemory};
pub use runners::next_run_delay;

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    /// Scheduler turns a signalled daemon gets to exit on its own before any
    /// waiting starts.
    pub instant_exit_zero_time_cycles: usize,
    /// Used when the handler sets no cancellation backoff.
    pub cancellation_backoff: Option<Duration>,
    /// Used when the handler sets no cancellation timeout; `None` waits forever.
    pub cancellation_timeout: Option<Duration>,
    /// How soon the object is looked at again while its daemons are stopping
    /// with no deadline in sight.
    pub stop_recheck: Duration,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            instant_exit_zero_time_cycles: 10,
            cancellation_backoff: None,
            cancellation_timeout: None,
            stop_recheck: Duration::from_secs(1),
        }
    }
}

/// Everything a daemon or timer of one object needs besides its handler.
#[derive(Clone)]
pub struct DaemonEnv {
    pub resource: Resource,
    pub client: Arc<dyn ApiClient>,
    /// The object's live cell, shared with its worker.
    pub body: Body,
    pub memo: Memo,
    pub indices: Indices,
    pub default_errors: ErrorsMode,
}
