//! Process-local records of the objects seen so far.

use std::sync::{Arc, Mutex, MutexGuard};

use kreact_core::bodies::{Body, RawEvent};
use kreact_daemons::DaemonsMemory;
use kreact_execution::Memo;
use rustc_hash::FxHashMap;

use crate::throttling::Throttler;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Default)]
struct Marks {
    noticed_by_listing: bool,
    fully_handled_once: bool,
}

/// Everything the operator keeps about one object between its events.
#[derive(Debug)]
pub struct ResourceMemory {
    /// The live cell, replaced in place by every fresher event.
    pub body: Body,
    pub memo: Memo,
    pub daemons: DaemonsMemory,
    pub(crate) throttler: Mutex<Throttler>,
    marks: Mutex<Marks>,
}

impl ResourceMemory {
    fn new(first: &RawEvent) -> Self {
        Self {
            body: Body::new(first.object.clone()),
            memo: Memo::default(),
            daemons: DaemonsMemory::new(),
            throttler: Mutex::default(),
            marks: Mutex::new(Marks { noticed_by_listing: first.event_type.is_none(), fully_handled_once: false }),
        }
    }

    /// Resuming applies only to objects that existed when the operator started,
    /// and only until their first full handling.
    pub fn is_initial(&self) -> bool {
        let marks = lock(&self.marks);
        marks.noticed_by_listing && !marks.fully_handled_once
    }

    pub(crate) fn mark_handled(&self) {
        lock(&self.marks).fully_handled_once = true;
    }

    pub fn is_throttled(&self) -> bool {
        lock(&self.throttler).is_active()
    }
}

/// Resource memories of one resource kind, keyed by object key.
#[derive(Debug, Default)]
pub struct Memories {
    objects: Mutex<FxHashMap<String, Arc<ResourceMemory>>>,
}

impl Memories {
    /// The memory of the event's object, created on first sight.
    pub fn recall(&self, key: &str, event: &RawEvent) -> Arc<ResourceMemory> {
        lock(&self.objects).entry(key.to_string()).or_insert_with(|| Arc::new(ResourceMemory::new(event))).clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<ResourceMemory>> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn forget(&self, key: &str) {
        lock(&self.objects).remove(key);
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Daemons memories of every remembered object, for the operator's exit.
    pub fn all_daemons(&self) -> Vec<DaemonsMemory> {
        lock(&self.objects).values().map(|m| m.daemons.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kreact_core::bodies::EventType;
    use serde_json::json;

    #[test]
    fn listed_objects_are_initial_until_handled() {
        let memories = Memories::default();
        let listed = RawEvent::listed(json!({"metadata": {"uid": "u1"}}));
        let m = memories.recall("u1", &listed);
        assert!(m.is_initial());
        m.mark_handled();
        assert!(!memories.recall("u1", &listed).is_initial());

        let added = RawEvent::new(EventType::Added, json!({"metadata": {"uid": "u2"}}));
        assert!(!memories.recall("u2", &added).is_initial());
        assert_eq!(memories.len(), 2);
        memories.forget("u1");
        assert!(memories.get("u1").is_none());
    }
}
