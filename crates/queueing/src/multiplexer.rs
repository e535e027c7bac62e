use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use kreact_core::bodies::{object_key, RawEvent};
use kreact_core::flags::Flag;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::worker::{lock, Stream, Streams, Worker};
use crate::{Item, Processor, QueueSettings};

/// Per-object backlogs and their workers for one watch stream.
pub struct Multiplexer {
    processor: Arc<dyn Processor>,
    settings: QueueSettings,
    streams: Streams,
    semaphore: Option<Arc<Semaphore>>,
    workers: JoinSet<anyhow::Result<()>>,
}

impl Multiplexer {
    pub fn new(processor: Arc<dyn Processor>, settings: QueueSettings) -> Self {
        let semaphore = settings.worker_limit.map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            processor,
            settings,
            streams: Arc::new(Mutex::new(FxHashMap::default())),
            semaphore,
            workers: JoinSet::new(),
        }
    }

    /// Objects that currently have a worker.
    pub fn live_streams(&self) -> usize {
        lock(&self.streams).len()
    }

    /// Route one event to its object's backlog, spawning a worker on first sight.
    ///
    /// Must be called within a tokio runtime.
    pub fn dispatch(&mut self, event: RawEvent) {
        let key = object_key(&event.object);
        let mut streams = lock(&self.streams);
        let event = match streams.get(&key) {
            Some(stream) => match stream.tx.send(Item::Event(event)) {
                Ok(()) => {
                    stream.pressure.raise();
                    return;
                }
                // The worker has already exited (it failed or saw the end of stream).
                Err(mpsc::error::SendError(Item::Event(event))) => event,
                Err(_) => return,
            },
            None => event,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let pressure = Flag::new();
        // The receiver is alive right here; this cannot fail.
        let _ = tx.send(Item::Event(event));
        streams.insert(key.clone(), Stream { tx, pressure: pressure.clone() });
        gauge!("queueing_streams", streams.len() as f64);
        drop(streams);

        let worker = Worker {
            key: key.clone(),
            rx,
            pressure,
            streams: self.streams.clone(),
            processor: self.processor.clone(),
            settings: self.settings.clone(),
            semaphore: self.semaphore.clone(),
        };
        counter!("queueing_workers_spawned_total", 1u64);
        self.workers.spawn(worker.run().instrument(info_span!("worker", key = %key)));
    }

    /// Consume events until the channel closes or `graceful` is cancelled, then
    /// shut down: drain workers up to `exit_timeout`, or not at all once `forced`
    /// is cancelled. A failing worker aborts everything with its error.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<RawEvent>,
        graceful: CancellationToken,
        forced: CancellationToken,
    ) -> anyhow::Result<()> {
        let outcome = loop {
            tokio::select! {
                _ = graceful.cancelled() => break Ok(()),
                _ = forced.cancelled() => break Ok(()),
                ev = events.recv() => match ev {
                    Some(ev) => self.dispatch(ev),
                    None => break Ok(()),
                },
                Some(joined) = self.workers.join_next(), if !self.workers.is_empty() => {
                    if let Err(e) = flatten(joined) {
                        break Err(e);
                    }
                }
            }
        };
        match outcome {
            Ok(()) => self.shutdown(&forced).await,
            Err(e) => {
                error!(error = %e, "worker failed; stopping all workers");
                self.workers.shutdown().await;
                lock(&self.streams).clear();
                Err(e)
            }
        }
    }

    async fn shutdown(&mut self, forced: &CancellationToken) -> anyhow::Result<()> {
        {
            let streams = lock(&self.streams);
            for stream in streams.values() {
                let _ = stream.tx.send(Item::EndOfStream);
                stream.pressure.raise();
            }
        }
        let mut result = Ok(());
        let deadline = tokio::time::sleep(self.settings.exit_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                biased;
                _ = forced.cancelled() => {
                    warn!(left = self.workers.len(), "forced exit; cancelling workers without draining");
                    break;
                }
                _ = &mut deadline => {
                    warn!(left = self.workers.len(), "workers did not finish in time; cancelling");
                    break;
                }
                joined = self.workers.join_next() => match joined {
                    None => break,
                    Some(joined) => {
                        if let Err(e) = flatten(joined) {
                            error!(error = %e, "worker failed during shutdown");
                            result = Err(e);
                        }
                    }
                }
            }
        }
        self.workers.shutdown().await;
        lock(&self.streams).clear();
        info!("multiplexer stopped");
        result
    }
}

fn flatten(joined: Result<anyhow::Result<()>, JoinError>) -> anyhow::Result<()> {
    match joined {
        Ok(res) => res,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(anyhow!("worker panicked: {e}")),
    }
}
