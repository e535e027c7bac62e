//! kreact reactor: turns watch events into handler invocations.
//!
//! One [`Reactor`] per resource kind sits behind a multiplexer and handles
//! the newest event of each object in turn; [`run`] wires watchers,
//! multiplexers and reactors together for every registered resource.

#![forbid(unsafe_code)]

mod memories;
mod orchestration;
mod processing;
pub mod settings;
mod throttling;

pub use memories::{Memories, ResourceMemory};
pub use orchestration::run;
pub use processing::Reactor;
pub use settings::Settings;
pub use throttling::Throttler;

use kreact_kubehub::ClientError;
use kreact_persist::StorageError;

/// Failures outside of the handlers' reach. Either kind throttles the object.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// The cluster API failed.
    #[error(transparent)]
    Client(#[from] ClientError),
    /// Stored state of the object cannot be read.
    #[error(transparent)]
    Storage(#[from] StorageError),
}
