//! In-memory indices built by indexing handlers over all objects of a resource.
//!
//! Every indexing handler owns one index. For each object, the handler's result
//! is that object's contribution: a map result contributes each entry under its
//! key; any other non-null result is contributed under the empty key. Lookups
//! collect the values of one key across all objects.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Map, Value};

#[derive(Debug, Default)]
struct Index {
    by_object: HashMap<String, Map<String, Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct Indices {
    inner: Arc<RwLock<HashMap<String, Index>>>,
}

impl Indices {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Index>> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Index>> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Make sure the index exists even before any object contributes to it.
    pub fn ensure(&self, index: &str) {
        self.write().entry(index.to_string()).or_default();
    }

    /// Replace one object's contribution; `None` removes it.
    pub fn replace(&self, index: &str, object: &str, contribution: Option<Value>) {
        let mut indices = self.write();
        let idx = indices.entry(index.to_string()).or_default();
        match contribution {
            None | Some(Value::Null) => {
                idx.by_object.remove(object);
            }
            Some(Value::Object(map)) => {
                idx.by_object.insert(object.to_string(), map);
            }
            Some(other) => {
                let mut map = Map::new();
                map.insert(String::new(), other);
                idx.by_object.insert(object.to_string(), map);
            }
        }
    }

    /// Forget an object in every index (it is gone).
    pub fn discard_object(&self, object: &str) {
        for idx in self.write().values_mut() {
            idx.by_object.remove(object);
        }
    }

    pub fn get(&self, index: &str, key: &str) -> Vec<Value> {
        let indices = self.read();
        let Some(idx) = indices.get(index) else { return Vec::new() };
        let mut objects: Vec<&String> = idx.by_object.keys().collect();
        objects.sort();
        objects.into_iter().filter_map(|o| idx.by_object[o].get(key).cloned()).collect()
    }

    pub fn keys(&self, index: &str) -> Vec<String> {
        let indices = self.read();
        let mut keys: Vec<String> = indices
            .get(index)
            .map(|idx| idx.by_object.values().flat_map(|m| m.keys().cloned()).collect())
            .unwrap_or_default();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn contains(&self, index: &str) -> bool {
        self.read().contains_key(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn contributions_are_collected_across_objects() {
        let ix = Indices::new();
        ix.replace("by_owner", "u1", Some(json!({"team-a": "pod-1"})));
        ix.replace("by_owner", "u2", Some(json!({"team-a": "pod-2", "team-b": "pod-2"})));
        assert_eq!(ix.get("by_owner", "team-a"), vec![json!("pod-1"), json!("pod-2")]);
        assert_eq!(ix.keys("by_owner"), vec!["team-a".to_string(), "team-b".to_string()]);

        ix.replace("by_owner", "u2", Some(json!({"team-b": "pod-2"})));
        assert_eq!(ix.get("by_owner", "team-a"), vec![json!("pod-1")]);
    }

    #[test]
    fn scalars_go_under_the_empty_key_and_objects_can_be_discarded() {
        let ix = Indices::new();
        ix.replace("names", "u1", Some(json!("a")));
        ix.replace("names", "u2", Some(json!("b")));
        assert_eq!(ix.get("names", ""), vec![json!("a"), json!("b")]);
        ix.discard_object("u1");
        assert_eq!(ix.get("names", ""), vec![json!("b")]);
        ix.replace("names", "u2", None);
        assert!(ix.get("names", "").is_empty());
        assert!(ix.contains("names"));
    }
}
