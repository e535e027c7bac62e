use std::sync::Arc;

use kreact_daemons::{stop_all_daemons, Termination};
use kreact_execution::{Indices, Registry};
use kreact_kubehub::{infinite_watch, ApiClient};
use kreact_queueing::Multiplexer;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::memories::Memories;
use crate::processing::Reactor;
use crate::settings::Settings;

/// Run the operator until `graceful` is cancelled or a multiplexer fails.
///
/// Every registered resource gets its own watcher and multiplexer. On the way
/// out, every daemon of every object is stopped; `forced` cuts all waiting
/// short, both for the workers and for the daemons.
pub async fn run(
    registry: Arc<Registry>,
    client: Arc<dyn ApiClient>,
    settings: Arc<Settings>,
    graceful: CancellationToken,
    forced: CancellationToken,
) -> anyhow::Result<()> {
    let indices = Indices::new();
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
    let mut memories: Vec<Arc<Memories>> = Vec::new();

    for resource in registry.resources() {
        let reactor =
            Arc::new(Reactor::new(resource.clone(), registry.clone(), client.clone(), settings.clone(), indices.clone()));
        memories.push(reactor.memories().clone());

        let (tx, rx) = mpsc::channel(settings.watching.queue_capacity.max(1));
        let watcher = infinite_watch(
            client.clone(),
            resource.clone(),
            settings.watching.namespace.clone(),
            settings.watching.watch_settings(),
            tx,
            graceful.clone(),
        );
        tasks.spawn(async move {
            watcher.await;
            Ok(())
        });

        let multiplexer = Multiplexer::new(reactor, settings.queue_settings());
        tasks.spawn(multiplexer.run(rx, graceful.clone(), forced.clone()));
        info!(resource = %resource, "serving resource");
    }
    if memories.is_empty() {
        warn!("no handlers registered; nothing to serve");
    }

    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let failure = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(e) => anyhow::anyhow!("task panicked: {e}"),
        };
        error!(error = %failure, "operator stopping after a failure");
        graceful.cancel();
        if result.is_ok() {
            result = Err(failure);
        }
    }

    let all = memories.iter().flat_map(|m| m.all_daemons());
    let report = stop_all_daemons(all, &settings.background, &forced).await;
    let abandoned = report.iter().filter(|(_, how)| *how == Termination::Abandoned).count();
    info!(stopped = report.len(), abandoned, "operator stopped");
    result
}
