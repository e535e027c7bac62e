//! Diff-base storages: the essence of the last successfully handled state.

use kreact_core::bodies::Body;
use kreact_core::diffs::FieldPath;
use kreact_core::patches::Patch;
use serde_json::Value;

use crate::essence;
use crate::keys::annotation_key;
use crate::{StorageError, StorageResult, DEFAULT_PREFIX};

pub trait DiffBaseStorage: Send + Sync {
    /// The essence of a body as this storage sees it (its own fields excluded).
    fn build(&self, body: &Value, extra_fields: &[FieldPath]) -> Value;

    fn fetch(&self, body: &Body) -> StorageResult<Option<Value>>;

    fn store(&self, body: &Body, patch: &mut Patch, essence: &Value);
}

/// The essence as a JSON string in `<prefix>/last-handled-configuration`.
#[derive(Debug, Clone)]
pub struct AnnotationsDiffBaseStorage {
    pub prefix: String,
    pub key: String,
}

impl Default for AnnotationsDiffBaseStorage {
    fn default() -> Self {
        Self { prefix: DEFAULT_PREFIX.to_string(), key: annotation_key(DEFAULT_PREFIX, "last-handled-configuration") }
    }
}

impl DiffBaseStorage for AnnotationsDiffBaseStorage {
    fn build(&self, body: &Value, extra_fields: &[FieldPath]) -> Value {
        essence::build(body, &self.prefix, extra_fields)
    }

    fn fetch(&self, body: &Body) -> StorageResult<Option<Value>> {
        match body.annotation(&self.key) {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StorageError::Malformed { key: self.key.clone(), source }),
        }
    }

    fn store(&self, body: &Body, patch: &mut Patch, essence: &Value) {
        let encoded = serde_json::to_string(essence).unwrap_or_default();
        if body.annotation(&self.key).as_deref() != Some(encoded.as_str()) {
            patch.set_annotation(&self.key, Some(encoded));
        }
    }
}

/// The essence as a structured value under `status.<field>.last-handled-configuration`.
#[derive(Debug, Clone)]
pub struct StatusDiffBaseStorage {
    pub prefix: String,
    pub field: String,
}

impl Default for StatusDiffBaseStorage {
    fn default() -> Self {
        Self { prefix: DEFAULT_PREFIX.to_string(), field: "kreact".to_string() }
    }
}

impl StatusDiffBaseStorage {
    fn path(&self) -> Vec<String> {
        vec!["status".into(), self.field.clone(), "last-handled-configuration".into()]
    }
}

impl DiffBaseStorage for StatusDiffBaseStorage {
    fn build(&self, body: &Value, extra_fields: &[FieldPath]) -> Value {
        let mut e = essence::build(body, &self.prefix, extra_fields);
        let emptied = match e.get_mut("status").and_then(Value::as_object_mut) {
            Some(status) => {
                status.remove(&self.field);
                status.is_empty()
            }
            None => false,
        };
        if let (true, Some(map)) = (emptied, e.as_object_mut()) {
            map.remove("status");
        }
        e
    }

    fn fetch(&self, body: &Body) -> StorageResult<Option<Value>> {
        Ok(body.field(&self.path()).filter(|v| !v.is_null()))
    }

    fn store(&self, body: &Body, patch: &mut Patch, essence: &Value) {
        let current = body.field(&self.path());
        if current.as_ref() != Some(essence) {
            // A merge patch keeps keys it does not mention: null out the removed ones.
            patch.set(&self.path(), with_removals(current.as_ref(), essence));
        }
    }
}

fn with_removals(old: Option<&Value>, new: &Value) -> Value {
    match (old, new) {
        (Some(Value::Object(old)), Value::Object(new)) => {
            let mut out = serde_json::Map::new();
            for (k, v) in new {
                out.insert(k.clone(), with_removals(old.get(k), v));
            }
            for k in old.keys().filter(|k| !new.contains_key(*k)) {
                out.insert(k.clone(), Value::Null);
            }
            Value::Object(out)
        }
        _ => new.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kreact_core::diffs::diff;
    use serde_json::json;

    fn body() -> Body {
        Body::new(json!({
            "metadata": {"name": "a", "uid": "u", "resourceVersion": "5"},
            "spec": {"field": 1}
        }))
    }

    #[test]
    fn stored_essence_is_not_part_of_the_next_essence() {
        let storage = AnnotationsDiffBaseStorage::default();
        let b = body();
        let e1 = storage.build(&b.snapshot(), &[]);
        let mut patch = Patch::new();
        storage.store(&b, &mut patch, &e1);
        b.replace(patch.apply_to(&b.snapshot()));

        let stored = storage.fetch(&b).unwrap();
        assert_eq!(stored.as_ref(), Some(&e1));
        let e2 = storage.build(&b.snapshot(), &[]);
        assert!(diff(stored.as_ref(), Some(&e2)).is_empty());
    }

    #[test]
    fn status_storage_roundtrip() {
        let storage = StatusDiffBaseStorage::default();
        let b = body();
        assert_eq!(storage.fetch(&b).unwrap(), None);
        let e = storage.build(&b.snapshot(), &[]);
        let mut patch = Patch::new();
        storage.store(&b, &mut patch, &e);
        b.replace(patch.apply_to(&b.snapshot()));
        assert_eq!(storage.fetch(&b).unwrap(), Some(e.clone()));
        assert_eq!(storage.build(&b.snapshot(), &[]), e);
    }

    #[test]
    fn status_storage_forgets_removed_fields() {
        let storage = StatusDiffBaseStorage::default();
        let b = body();
        let mut patch = Patch::new();
        storage.store(&b, &mut patch, &json!({"spec": {"a": 1, "b": 2}}));
        b.replace(patch.apply_to(&b.snapshot()));
        let mut patch = Patch::new();
        storage.store(&b, &mut patch, &json!({"spec": {"a": 1}}));
        b.replace(patch.apply_to(&b.snapshot()));
        assert_eq!(storage.fetch(&b).unwrap(), Some(json!({"spec": {"a": 1}})));
    }

    #[test]
    fn unchanged_essence_needs_no_patch() {
        let storage = AnnotationsDiffBaseStorage::default();
        let b = body();
        let e = storage.build(&b.snapshot(), &[]);
        let mut patch = Patch::new();
        storage.store(&b, &mut patch, &e);
        b.replace(patch.apply_to(&b.snapshot()));
        let mut again = Patch::new();
        storage.store(&b, &mut again, &e);
        assert!(again.is_empty());
    }
}
