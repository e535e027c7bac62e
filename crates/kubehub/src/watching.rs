use std::sync::Arc;
use std::time::Duration;

use kreact_core::bodies::RawEvent;
use kreact_core::resources::Resource;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ApiClient, ClientError};

#[derive(Debug, Clone)]
pub struct WatchSettings {
    /// Pause before relisting after an unexpected failure.
    pub reconnect_backoff: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self { reconnect_backoff: Duration::from_millis(100) }
    }
}

/// List, then watch from the listed version, forever.
///
/// Listed objects are delivered as events with no type. The watch is resumed
/// from the last seen version when the server ends it, and the whole cycle
/// restarts with a fresh listing when the version expires (410) or the call
/// fails. Returns when `stop` is cancelled or the receiver is dropped.
pub async fn infinite_watch(
    client: Arc<dyn ApiClient>,
    resource: Resource,
    namespace: Option<String>,
    settings: WatchSettings,
    tx: mpsc::Sender<RawEvent>,
    stop: CancellationToken,
) {
    let ns = namespace.as_deref();
    info!(resource = %resource, ns = ?ns, "watcher started");
    'relist: while !stop.is_cancelled() && !tx.is_closed() {
        let listed = tokio::select! {
            _ = stop.cancelled() => break,
            res = client.list(&resource, ns) => res,
        };
        let mut since = match listed {
            Ok((objects, rv)) => {
                debug!(resource = %resource, count = objects.len(), "initial listing");
                for obj in objects {
                    if tx.send(RawEvent::listed(obj)).await.is_err() {
                        break 'relist;
                    }
                }
                rv
            }
            Err(e) => {
                warn!(resource = %resource, error = %e, "listing failed; retrying");
                backoff(&settings, &stop).await;
                continue;
            }
        };
        loop {
            let watched = tokio::select! {
                _ = stop.cancelled() => break 'relist,
                res = client.watch(&resource, ns, since.as_deref(), &tx) => res,
            };
            match watched {
                Ok(_) if tx.is_closed() => break 'relist,
                Ok(last) => {
                    debug!(resource = %resource, since = ?last, "watch ended; resuming");
                    since = last;
                }
                Err(ClientError::Gone(msg)) => {
                    debug!(resource = %resource, reason = %msg, "watch version expired; relisting");
                    continue 'relist;
                }
                Err(e) => {
                    warn!(resource = %resource, error = %e, "watch failed; relisting");
                    backoff(&settings, &stop).await;
                    continue 'relist;
                }
            }
        }
    }
    info!(resource = %resource, "watcher stopped");
}

async fn backoff(settings: &WatchSettings, stop: &CancellationToken) {
    tokio::select! {
        _ = stop.cancelled() => {}
        _ = tokio::time::sleep(settings.reconnect_backoff) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockClient;
    use kreact_core::bodies::EventType;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn listing_then_scripted_watch_then_relist_on_expiry() {
        let r = Resource::new("example.com", "v1", "widgets", "Widget", true);
        let mock = Arc::new(MockClient::new());
        mock.insert(json!({"metadata": {"name": "a", "namespace": "ns", "uid": "u-a"}}));
        mock.script_watch(vec![RawEvent::new(
            EventType::Modified,
            json!({"metadata": {"name": "a", "namespace": "ns", "uid": "u-a", "resourceVersion": "7"}}),
        )]);
        mock.script_expiry();

        let (tx, mut rx) = mpsc::channel(16);
        let stop = CancellationToken::new();
        let task = tokio::spawn(infinite_watch(mock.clone(), r, None, WatchSettings::default(), tx, stop.clone()));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, None);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event_type, Some(EventType::Modified));
        // 410 makes the loop relist: the object comes again as a listed one.
        let third = rx.recv().await.unwrap();
        assert_eq!(third.event_type, None);
        assert!(mock.list_calls() >= 2);

        stop.cancel();
        task.await.unwrap();
    }
}
