//! kreact persistence: everything the framework remembers across restarts lives
//! in the objects themselves, as annotations or status fields.
//!
//! - progress storages keep one record per handler (retries, delays, outcome);
//! - diff-base storages keep the essence of the last handled state.
//!
//! Storages never talk to the cluster: they read from a [`Body`] and write into
//! the cycle's [`Patch`], which the reactor applies once.
//!
//! [`Body`]: kreact_core::bodies::Body
//! [`Patch`]: kreact_core::patches::Patch

#![forbid(unsafe_code)]

pub mod diffbase;
pub mod essence;
pub mod keys;
pub mod progress;

pub use diffbase::{AnnotationsDiffBaseStorage, DiffBaseStorage, StatusDiffBaseStorage};
pub use progress::{
    AnnotationsProgressStorage, ProgressRecord, ProgressStorage, SmartProgressStorage, StatusProgressStorage,
};

/// Default prefix of every annotation and status stanza owned by the framework.
pub const DEFAULT_PREFIX: &str = "kreact.dev";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("malformed stored state under {key}: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
