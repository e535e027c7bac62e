//! kreact queueing: the multiplexer.
//!
//! One watch stream per resource kind carries events about many objects. The
//! multiplexer fans them out into one backlog per object and runs one worker per
//! backlog, so events of the same object are handled strictly one after another
//! while different objects proceed concurrently.
//!
//! ```text
//! watch ─► Multiplexer::dispatch ─► backlog[uid] ─► worker ─► Processor::process
//!                                  └► pressure[uid].raise()   (interrupts sleeps)
//! ```

#![forbid(unsafe_code)]

use std::time::Duration;

use kreact_core::bodies::RawEvent;
use kreact_core::flags::Flag;

mod multiplexer;
mod worker;

pub use multiplexer::Multiplexer;

/// Handles the newest event of an object.
#[async_trait::async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Returns the resource version produced by the processor's own patch, if any;
    /// the worker then waits (bounded) for that version before the next batch.
    ///
    /// `pressure` is raised when newer events for the same object arrive. Errors
    /// are infrastructure failures and abort the whole multiplexer.
    async fn process(&self, event: RawEvent, pressure: &Flag) -> anyhow::Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Concurrently running workers; `None` is unbounded.
    pub worker_limit: Option<usize>,
    /// A worker with nothing to do for this long retires.
    pub idle_timeout: Duration,
    /// Events arriving within this window after one another are coalesced;
    /// only the newest one is processed.
    pub batch_window: Duration,
    /// How long shutdown waits for workers to drain before cancelling them.
    pub exit_timeout: Duration,
    /// How long to wait for a just-patched resource version to come back.
    pub consistency_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            worker_limit: None,
            idle_timeout: Duration::from_secs(5),
            batch_window: Duration::from_millis(100),
            exit_timeout: Duration::from_secs(2),
            consistency_timeout: Duration::from_secs(5),
        }
    }
}

/// What travels through a backlog.
#[derive(Debug)]
pub(crate) enum Item {
    Event(RawEvent),
    EndOfStream,
}
