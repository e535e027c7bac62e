//! kreact core types: resources, raw events, live bodies, patches, diffs, finalizers
//! and the cause detector.

#![forbid(unsafe_code)]

pub mod bodies;
pub mod causes;
pub mod diffs;
pub mod finalizers;
pub mod flags;
pub mod patches;
pub mod resources;

pub mod prelude {
    pub use super::bodies::{object_key, Body, EventType, RawEvent};
    pub use super::causes::{detect_changing_cause, ChangingCause, Reason, SpawningCause, WatchingCause};
    pub use super::diffs::{diff, Diff, DiffItem, DiffOperation, FieldPath};
    pub use super::flags::{sleep_or_wait, Flag};
    pub use super::patches::Patch;
    pub use super::resources::Resource;
}
