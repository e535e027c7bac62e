//! Handlers registered per resource, with the selection queries the reactor
//! makes on every event.

use std::collections::BTreeMap;

use kreact_core::bodies::Body;
use kreact_core::causes::ChangingCause;
use kreact_core::resources::Resource;

use crate::handlers::{ChangingHandler, Handler, IndexingHandler, SpawningHandler, WatchingHandler};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler '{id}' is already registered for {resource}")]
    Duplicate { resource: String, id: String },
}

#[derive(Debug, Clone, Default)]
pub struct ResourceHandlers {
    pub indexing: Vec<IndexingHandler>,
    pub watching: Vec<WatchingHandler>,
    pub changing: Vec<ChangingHandler>,
    pub spawning: Vec<SpawningHandler>,
}

impl ResourceHandlers {
    fn contains(&self, id: &str) -> bool {
        self.indexing.iter().any(|h| h.base.id == id)
            || self.watching.iter().any(|h| h.base.id == id)
            || self.changing.iter().any(|h| h.base.id == id)
            || self.spawning.iter().any(|h| h.base.id == id)
    }
}

/// Registration order is kept within each kind; lifecycles rely on it.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    resources: BTreeMap<String, (Resource, ResourceHandlers)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource: &Resource, handler: impl Into<Handler>) -> Result<(), RegistryError> {
        let handler = handler.into();
        let key = resource.key();
        let (_, handlers) =
            self.resources.entry(key.clone()).or_insert_with(|| (resource.clone(), ResourceHandlers::default()));
        if handlers.contains(handler.id()) {
            return Err(RegistryError::Duplicate { resource: key, id: handler.id().to_string() });
        }
        match handler {
            Handler::Indexing(h) => handlers.indexing.push(h),
            Handler::Watching(h) => handlers.watching.push(h),
            Handler::Changing(h) => handlers.changing.push(h),
            Handler::Spawning(h) => handlers.spawning.push(h),
        }
        Ok(())
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values().map(|(r, _)| r)
    }

    pub fn handlers(&self, resource: &Resource) -> Option<&ResourceHandlers> {
        self.resources.get(&resource.key()).map(|(_, h)| h)
    }

    pub fn indexing_handlers(&self, resource: &Resource, body: &Body) -> Vec<&IndexingHandler> {
        self.handlers(resource)
            .map(|h| h.indexing.iter().filter(|h| h.base.filters.matches(body)).collect())
            .unwrap_or_default()
    }

    /// Names of every index of the resource, matching or not.
    pub fn index_names(&self, resource: &Resource) -> Vec<&str> {
        self.handlers(resource).map(|h| h.indexing.iter().map(|h| h.base.id.as_str()).collect()).unwrap_or_default()
    }

    pub fn watching_handlers(&self, resource: &Resource, body: &Body) -> Vec<&WatchingHandler> {
        self.handlers(resource)
            .map(|h| h.watching.iter().filter(|h| h.base.filters.matches(body)).collect())
            .unwrap_or_default()
    }

    /// The change handlers applicable to the cause, in registration order.
    pub fn changing_handlers(&self, resource: &Resource, cause: &ChangingCause) -> Vec<ChangingHandler> {
        self.handlers(resource)
            .map(|h| h.changing.iter().filter(|h| h.matches(cause)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_changing_handlers(&self, resource: &Resource) -> bool {
        self.handlers(resource).map_or(false, |h| !h.changing.is_empty())
    }

    pub fn spawning_handlers(&self, resource: &Resource, body: &Body) -> Vec<&SpawningHandler> {
        self.handlers(resource)
            .map(|h| h.spawning.iter().filter(|h| h.base.filters.matches(body)).collect())
            .unwrap_or_default()
    }

    pub fn all_spawning_handlers(&self, resource: &Resource) -> &[SpawningHandler] {
        self.handlers(resource).map_or(&[], |h| h.spawning.as_slice())
    }

    /// Whether the object must carry the finalizer: some deletion handler or
    /// daemon/timer that needs it matches the object.
    pub fn requires_finalizer(&self, resource: &Resource, body: &Body) -> bool {
        let Some(handlers) = self.handlers(resource) else { return false };
        handlers
            .changing
            .iter()
            .any(|h| h.is_deletion_handler() && h.requires_finalizer && h.base.filters.matches(body))
            || handlers.spawning.iter().any(|h| h.requires_finalizer && h.base.filters.matches(body))
    }
}
