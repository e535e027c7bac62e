//! kreact kubehub: the client boundary (list, watch, patch) and the infinite
//! list+watch loop feeding the multiplexer.

#![forbid(unsafe_code)]

use kreact_core::patches::Patch;
use kreact_core::resources::Resource;
use kreact_core::bodies::RawEvent;
use serde_json::Value;
use tokio::sync::mpsc;

mod kube_client;
mod mock;
pub mod retries;
mod watching;

pub use kube_client::KubeClient;
pub use mock::MockClient;
pub use retries::RetryPolicy;
pub use watching::{infinite_watch, WatchSettings};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The requested resource version is too old (HTTP 410); relist.
    #[error("resource version expired: {0}")]
    Gone(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    /// Network failures, 5xx and 429 are worth retrying; other 4xx are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Api { code, .. } => *code >= 500 || *code == 429,
            ClientError::Gone(_) | ClientError::Decode(_) => false,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// What the reactor needs from a cluster.
#[async_trait::async_trait]
pub trait ApiClient: Send + Sync {
    /// List objects; returns them with the list's resource version.
    async fn list(&self, resource: &Resource, namespace: Option<&str>) -> ClientResult<(Vec<Value>, Option<String>)>;

    /// Stream change events since `since` into `tx` until the server ends the
    /// stream. Returns the last resource version seen (events or bookmarks).
    /// An expired version yields [`ClientError::Gone`].
    async fn watch(
        &self,
        resource: &Resource,
        namespace: Option<&str>,
        since: Option<&str>,
        tx: &mpsc::Sender<RawEvent>,
    ) -> ClientResult<Option<String>>;

    /// Merge-patch an object. `Ok(None)` means the object is gone; that is not an error.
    async fn patch(
        &self,
        resource: &Resource,
        namespace: Option<&str>,
        name: &str,
        patch: &Patch,
    ) -> ClientResult<Option<Value>>;
}
