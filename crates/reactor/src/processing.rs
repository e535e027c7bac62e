//! One event of one object: indices, watchers, daemons, changing handlers,
//! finalizers, and finally one patch back to the cluster.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use kreact_core::bodies::{meta_str, object_key, RawEvent};
use kreact_core::causes::{detect_changing_cause, Reason};
use kreact_core::diffs::FieldPath;
use kreact_core::finalizers::{allow_deletion, block_deletion, is_deletion_blocked, is_deletion_ongoing};
use kreact_core::flags::{sleep_or_wait, Flag};
use kreact_core::patches::Patch;
use kreact_core::resources::Resource;
use kreact_daemons::{match_daemons, spawn_daemons, stop_daemons, DaemonEnv, StopReason};
use kreact_execution::{execute_cycle, invoke, CauseInfo, HandlerContext, Indices, Registry, Scope};
use kreact_kubehub::ApiClient;
use kreact_persist::{DiffBaseStorage, ProgressStorage};
use kreact_queueing::Processor;
use metrics::{counter, histogram};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::memories::{lock, Memories, ResourceMemory};
use crate::settings::Settings;
use crate::ReactorError;

/// The per-resource processor behind a multiplexer.
pub struct Reactor {
    resource: Resource,
    registry: Arc<Registry>,
    client: Arc<dyn ApiClient>,
    settings: Arc<Settings>,
    memories: Arc<Memories>,
    indices: Indices,
    progress: Arc<dyn ProgressStorage>,
    diffbase: Arc<dyn DiffBaseStorage>,
}

impl Reactor {
    pub fn new(
        resource: Resource,
        registry: Arc<Registry>,
        client: Arc<dyn ApiClient>,
        settings: Arc<Settings>,
        indices: Indices,
    ) -> Self {
        for name in registry.index_names(&resource) {
            indices.ensure(name);
        }
        Self {
            progress: settings.persistence.progress_storage(),
            diffbase: settings.persistence.diffbase_storage(),
            memories: Arc::new(Memories::default()),
            resource,
            registry,
            client,
            settings,
            indices,
        }
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn memories(&self) -> &Arc<Memories> {
        &self.memories
    }

    /// Handle the newest known state of one object.
    ///
    /// Returns the resource version produced by the reactor's own patch, if
    /// any. Handler failures never surface here; only the cluster API and
    /// malformed stored state do, and both only throttle this one object.
    pub async fn process_one_event(&self, raw: RawEvent, pressure: &Flag) -> Result<Option<String>, ReactorError> {
        let key = object_key(&raw.object);
        let span = info_span!(
            "object",
            resource = %self.resource,
            uid = %key,
            name = meta_str(&raw.object, "name").unwrap_or_default(),
        );
        counter!("reactor_events_total", 1u64, "resource" => self.resource.key());
        self.react(key, raw, pressure).instrument(span).await
    }

    async fn react(&self, key: String, raw: RawEvent, pressure: &Flag) -> Result<Option<String>, ReactorError> {
        let memory = self.memories.recall(&key, &raw);
        memory.body.replace(raw.object.clone());
        memory.daemons.touch();

        self.run_indexing(&key, &raw, &memory).await;
        let mut patch = Patch::new();
        self.run_watching(&raw, &memory, &mut patch).await;

        if raw.is_deleted() {
            let delays = stop_daemons(&memory.daemons, StopReason::Deletion, &self.settings.background).await;
            if !delays.is_empty() {
                debug!(stopping = delays.len(), "object gone while its daemons are still stopping");
            }
            self.memories.forget(&key);
            debug!("object gone; memory released");
            return Ok(None);
        }

        let body = memory.body.clone();
        let finalizer = self.settings.persistence.finalizer.as_str();
        let deletion = is_deletion_ongoing(&body);
        let mut delays = Vec::new();

        if !self.registry.all_spawning_handlers(&self.resource).is_empty() {
            delays.extend(self.process_spawning(&memory, deletion).await);
        }

        let requires = self.registry.requires_finalizer(&self.resource, &body);
        let blocked = is_deletion_blocked(&body, finalizer);
        if !deletion && requires && !blocked {
            info!("adding the finalizer; deletion blocked");
            block_deletion(&body, &mut patch, finalizer);
        } else if !deletion && !requires && blocked {
            info!("removing the finalizer; no handlers require it");
            allow_deletion(&body, &mut patch, finalizer);
        } else {
            let changing_delays = if self.registry.has_changing_handlers(&self.resource) {
                self.process_changing(&raw, &memory, &mut patch).await?
            } else {
                Vec::new()
            };
            let released = changing_delays.is_empty() && delays.is_empty() && memory.daemons.is_empty();
            if deletion && blocked && released {
                info!("removing the finalizer; deletion allowed");
                allow_deletion(&body, &mut patch, finalizer);
            }
            delays.extend(changing_delays);
        }

        if !patch.is_empty() {
            if !delays.is_empty() {
                debug!("sleep skipped; the patch re-triggers the handling");
            }
            return self.apply_patch(&memory, &patch).await;
        }
        match delays.into_iter().min() {
            Some(delay) => self.sleep_then_touch(&memory, delay, pressure).await,
            None => Ok(None),
        }
    }

    /// Sleep until the next handler is due, then provoke a new event, unless
    /// newer changes arrive first. A zero delay touches right away.
    async fn sleep_then_touch(
        &self,
        memory: &ResourceMemory,
        delay: Duration,
        pressure: &Flag,
    ) -> Result<Option<String>, ReactorError> {
        if !delay.is_zero() {
            debug!(?delay, "sleeping until the next handling");
            if let Some(unslept) = sleep_or_wait(delay, Some(pressure)).await {
                debug!(?unslept, "sleeping interrupted by new changes");
                return Ok(None);
            }
        }
        let mut touch = Patch::new();
        let marker = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
        self.progress.touch(&memory.body, &mut touch, Some(&marker));
        self.apply_patch(memory, &touch).await
    }

    async fn run_indexing(&self, key: &str, raw: &RawEvent, memory: &ResourceMemory) {
        let Some(handlers) = self.registry.handlers(&self.resource) else { return };
        if raw.is_deleted() {
            self.indices.discard_object(key);
            return;
        }
        for handler in &handlers.indexing {
            let id = handler.base.id.as_str();
            if !handler.base.filters.matches(&memory.body) {
                self.indices.replace(id, key, None);
                continue;
            }
            let ctx = HandlerContext::new(
                id,
                memory.body.clone(),
                CauseInfo::Indexing,
                memory.memo.clone(),
                self.indices.clone(),
            );
            match invoke(&handler.base.func, ctx).await {
                Ok(contribution) => self.indices.replace(id, key, contribution),
                Err(e) => warn!(handler = %id, error = %e, "indexing handler failed; previous entry kept"),
            }
        }
    }

    async fn run_watching(&self, raw: &RawEvent, memory: &ResourceMemory, patch: &mut Patch) {
        let shared = Arc::new(Mutex::new(Patch::new()));
        for handler in self.registry.watching_handlers(&self.resource, &memory.body) {
            let ctx = HandlerContext::new(
                handler.base.id.clone(),
                memory.body.clone(),
                CauseInfo::Watching(raw.event_type),
                memory.memo.clone(),
                self.indices.clone(),
            )
            .with_patch(shared.clone());
            if let Err(e) = invoke(&handler.base.func, ctx).await {
                warn!(handler = %handler.base.id, error = %e, "watching handler failed; ignored");
            }
        }
        patch.merge(&lock(&shared));
    }

    async fn process_spawning(&self, memory: &ResourceMemory, deletion: bool) -> Vec<Duration> {
        let settings = &self.settings.background;
        if deletion {
            return stop_daemons(&memory.daemons, StopReason::Deletion, settings).await;
        }
        let matching = self.registry.spawning_handlers(&self.resource, &memory.body);
        let delays = match_daemons(&memory.daemons, &matching, settings).await;
        let env = DaemonEnv {
            resource: self.resource.clone(),
            client: self.client.clone(),
            body: memory.body.clone(),
            memo: memory.memo.clone(),
            indices: self.indices.clone(),
            default_errors: self.settings.execution.default_errors,
        };
        spawn_daemons(&memory.daemons, matching, &env);
        delays
    }

    /// Status fields watched by field handlers must survive into the essence.
    fn essential_fields(&self) -> Vec<FieldPath> {
        let Some(handlers) = self.registry.handlers(&self.resource) else { return Vec::new() };
        handlers
            .changing
            .iter()
            .filter_map(|h| h.field.as_ref())
            .filter(|f| f.first().map(String::as_str) == Some("status"))
            .cloned()
            .collect()
    }

    async fn process_changing(
        &self,
        raw: &RawEvent,
        memory: &ResourceMemory,
        patch: &mut Patch,
    ) -> Result<Vec<Duration>, ReactorError> {
        let body = &memory.body;
        let old = self.diffbase.fetch(body)?;
        let new = self.progress.clear(self.diffbase.build(&body.snapshot(), &self.essential_fields()));
        let cause = detect_changing_cause(
            raw.event_type,
            body,
            old,
            Some(new.clone()),
            &self.settings.persistence.finalizer,
            memory.is_initial(),
        );
        let reason = cause.reason;
        if reason == Reason::Free {
            return Ok(Vec::new());
        }

        let handlers = if reason.is_handled() {
            self.registry.changing_handlers(&self.resource, &cause)
        } else {
            Vec::new()
        };
        let mut delays = Vec::new();
        if !handlers.is_empty() {
            let scope = Arc::new(
                Scope::new(cause, memory.memo.clone(), self.indices.clone(), self.progress.clone())
                    .with_lifecycle(self.settings.execution.lifecycle)
                    .with_errors(self.settings.execution.default_errors),
            );
            let state = execute_cycle(&scope, &handlers).await?;
            if state.done() {
                let (succeeded, failed, _) = state.counts();
                info!(%reason, succeeded, failed, "handling of the {} finished", reason.title());
                scope.purge(&state);
            } else {
                delays = state.delays(Utc::now());
            }
            patch.merge(&scope.take_patch());
        } else if reason != Reason::Noop {
            debug!(%reason, "no handlers match the cause");
        }

        if delays.is_empty() && reason != Reason::Delete {
            self.diffbase.store(body, patch, &new);
            memory.mark_handled();
        }
        Ok(delays)
    }

    async fn apply_patch(&self, memory: &ResourceMemory, patch: &Patch) -> Result<Option<String>, ReactorError> {
        let Some(name) = memory.body.name() else {
            warn!("object has no name; patch dropped");
            return Ok(None);
        };
        let namespace = memory.body.namespace();
        let t0 = Instant::now();
        let patched = self.client.patch(&self.resource, namespace.as_deref(), &name, patch).await?;
        histogram!("reactor_patch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match patched {
            Some(obj) => {
                let rv = meta_str(&obj, "resourceVersion").map(str::to_string);
                memory.body.replace(obj);
                Ok(rv)
            }
            None => {
                debug!("patch skipped; object is gone");
                Ok(None)
            }
        }
    }
}

#[async_trait::async_trait]
impl Processor for Reactor {
    async fn process(&self, event: RawEvent, pressure: &Flag) -> anyhow::Result<Option<String>> {
        let key = object_key(&event.object);
        let result = self.process_one_event(event, pressure).await;
        let Some(memory) = self.memories.get(&key) else {
            return Ok(result?);
        };
        match result {
            Ok(rv) => {
                lock(&memory.throttler).reset();
                Ok(rv)
            }
            Err(e) => {
                let delay = lock(&memory.throttler).next_delay(&self.settings.batching.error_delays);
                counter!("reactor_throttled_total", 1u64, "resource" => self.resource.key());
                match &e {
                    ReactorError::Client(e) => warn!(uid = %key, error = %e, ?delay, "api failure; throttling the object"),
                    ReactorError::Storage(e) => {
                        error!(uid = %key, error = %e, ?delay, "stored state is unreadable; throttling the object")
                    }
                }
                if let Some(delay) = delay {
                    sleep_or_wait(delay, Some(pressure)).await;
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kreact_core::bodies::{EventType, RawEvent};
    use kreact_execution::Registry;
    use kreact_kubehub::MockClient;
    use serde_json::json;

    fn reactor(client: Arc<MockClient>) -> Reactor {
        let resource = Resource::new("kopf.dev", "v1", "kopfexamples", "KopfExample", true);
        Reactor::new(resource, Arc::new(Registry::new()), client, Arc::new(Settings::default()), Indices::new())
    }

    fn remembered(reactor: &Reactor, client: &MockClient) -> Arc<ResourceMemory> {
        let obj = client.insert(json!({"metadata": {"name": "ex", "namespace": "ns"}}));
        let key = object_key(&obj);
        reactor.memories.recall(&key, &RawEvent::new(EventType::Added, obj))
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delays_touch_at_once() {
        let client = Arc::new(MockClient::new());
        let reactor = reactor(client.clone());
        let memory = remembered(&reactor, &client);

        let t0 = tokio::time::Instant::now();
        let rv = reactor.sleep_then_touch(&memory, Duration::ZERO, &Flag::new()).await.unwrap();
        assert!(rv.is_some());
        assert_eq!(t0.elapsed(), Duration::ZERO);
        let stored = client.get(Some("ns"), "ex").unwrap();
        assert!(stored["metadata"]["annotations"]["kreact.dev/touch-dummy"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn new_changes_cancel_the_touch() {
        let client = Arc::new(MockClient::new());
        let reactor = reactor(client.clone());
        let memory = remembered(&reactor, &client);
        let pressure = Flag::new();
        pressure.raise();

        let rv = reactor.sleep_then_touch(&memory, Duration::from_secs(10), &pressure).await.unwrap();
        assert_eq!(rv, None);
        assert!(client.patches().is_empty());
    }
}
