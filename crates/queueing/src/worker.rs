use std::sync::{Arc, Mutex, MutexGuard};

use kreact_core::bodies::RawEvent;
use kreact_core::flags::Flag;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::{Item, Processor, QueueSettings};

pub(crate) struct Stream {
    pub tx: mpsc::UnboundedSender<Item>,
    pub pressure: Flag,
}

pub(crate) type Streams = Arc<Mutex<FxHashMap<String, Stream>>>;

pub(crate) fn lock(streams: &Streams) -> MutexGuard<'_, FxHashMap<String, Stream>> {
    streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct Worker {
    pub key: String,
    pub rx: mpsc::UnboundedReceiver<Item>,
    pub pressure: Flag,
    pub streams: Streams,
    pub processor: Arc<dyn Processor>,
    pub settings: QueueSettings,
    pub semaphore: Option<Arc<Semaphore>>,
}

impl Worker {
    pub async fn run(mut self) -> anyhow::Result<()> {
        let _permit = match &self.semaphore {
            Some(sem) => Some(sem.clone().acquire_owned().await?),
            None => None,
        };
        debug!("worker started");
        // The version our last patch produced, and until when to wait for it.
        let mut expected: Option<(String, Instant)> = None;
        let mut closing = false;
        while !closing {
            let Some(item) = self.next_or_retire().await else { break };
            let Item::Event(mut event) = item else { break };
            loop {
                if event.is_deleted() || matches!(&expected, Some((rv, _)) if event.resource_version() == Some(rv.as_str())) {
                    expected = None;
                }
                let window = match &expected {
                    Some((_, deadline)) => deadline.saturating_duration_since(Instant::now()),
                    None => self.settings.batch_window,
                };
                match timeout(window, self.rx.recv()).await {
                    Ok(Some(Item::Event(newer))) => {
                        counter!("queueing_events_coalesced_total", 1u64);
                        event = newer;
                    }
                    Ok(Some(Item::EndOfStream)) | Ok(None) => {
                        closing = true;
                        break;
                    }
                    Err(_) => {
                        if let Some((rv, _)) = expected.take() {
                            debug!(expected = %rv, "consistency window elapsed; processing the newest event");
                        }
                        break;
                    }
                }
            }
            expected = self.process(event).await?;
        }
        debug!("worker finished");
        Ok(())
    }

    async fn process(&self, event: RawEvent) -> anyhow::Result<Option<(String, Instant)>> {
        self.pressure.clear();
        let t0 = Instant::now();
        let produced = self.processor.process(event, &self.pressure).await?;
        histogram!("queueing_process_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("queueing_events_processed_total", 1u64);
        Ok(produced.map(|rv| (rv, Instant::now() + self.settings.consistency_timeout)))
    }

    /// The next item, or `None` once idle for too long. Emptiness is re-checked
    /// under the streams lock, which every push takes too, so no push is lost.
    async fn next_or_retire(&mut self) -> Option<Item> {
        match timeout(self.settings.idle_timeout, self.rx.recv()).await {
            Ok(item) => item,
            Err(_) => {
                let mut streams = lock(&self.streams);
                match self.rx.try_recv() {
                    Ok(item) => Some(item),
                    Err(_) => {
                        streams.remove(&self.key);
                        trace!("worker idle; retiring");
                        None
                    }
                }
            }
        }
    }
}
