//! Per-handler progress records, persisted in the object between cycles.

use chrono::{DateTime, Utc};
use kreact_core::bodies::Body;
use kreact_core::patches::Patch;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::keys::annotation_key;
use crate::{StorageError, StorageResult, DEFAULT_PREFIX};

/// What is persisted per (object, handler). Absent means never attempted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delayed: Option<DateTime<Utc>>,
    /// The reason the record was started for; a record for another reason is stale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    pub retries: u32,
    pub success: bool,
    pub failure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subrefs: Option<Vec<String>>,
}

pub trait ProgressStorage: Send + Sync {
    fn fetch(&self, key: &str, body: &Body) -> StorageResult<Option<ProgressRecord>>;
    fn store(&self, key: &str, record: &ProgressRecord, body: &Body, patch: &mut Patch);
    fn purge(&self, key: &str, body: &Body, patch: &mut Patch);

    /// Write a marker whose only purpose is to produce a new resource version,
    /// so the object is handled again. `None` removes the marker.
    fn touch(&self, body: &Body, patch: &mut Patch, value: Option<&str>);

    /// Remove this storage's own fields from an essence.
    fn clear(&self, essence: Value) -> Value;
}

/// One annotation per handler, holding the record as a JSON string.
#[derive(Debug, Clone)]
pub struct AnnotationsProgressStorage {
    pub prefix: String,
    pub touch_key: String,
}

impl Default for AnnotationsProgressStorage {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }
}

impl AnnotationsProgressStorage {
    pub fn with_prefix(prefix: &str) -> Self {
        Self { prefix: prefix.to_string(), touch_key: annotation_key(prefix, "touch-dummy") }
    }
}

impl ProgressStorage for AnnotationsProgressStorage {
    fn fetch(&self, key: &str, body: &Body) -> StorageResult<Option<ProgressRecord>> {
        let full = annotation_key(&self.prefix, key);
        match body.annotation(&full) {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StorageError::Malformed { key: full, source }),
        }
    }

    fn store(&self, key: &str, record: &ProgressRecord, _body: &Body, patch: &mut Patch) {
        let encoded = serde_json::to_string(record).unwrap_or_default();
        patch.set_annotation(&annotation_key(&self.prefix, key), Some(encoded));
        counter!("persist_progress_stored_total", 1u64);
    }

    fn purge(&self, key: &str, body: &Body, patch: &mut Patch) {
        let full = annotation_key(&self.prefix, key);
        if body.annotation(&full).is_some() {
            patch.set_annotation(&full, None);
        }
    }

    fn touch(&self, body: &Body, patch: &mut Patch, value: Option<&str>) {
        if body.annotation(&self.touch_key).as_deref() != value {
            patch.set_annotation(&self.touch_key, value.map(str::to_string));
        }
    }

    fn clear(&self, mut essence: Value) -> Value {
        let own = format!("{}/", self.prefix);
        if let Some(annotations) = essence
            .get_mut("metadata")
            .and_then(|m| m.get_mut("annotations"))
            .and_then(Value::as_object_mut)
        {
            annotations.retain(|k, _| !k.starts_with(&own));
        }
        essence
    }
}

/// Records under `status.<field>.progress.<handler id>`, as structured values.
#[derive(Debug, Clone)]
pub struct StatusProgressStorage {
    pub field: String,
}

impl Default for StatusProgressStorage {
    fn default() -> Self {
        Self { field: "kreact".to_string() }
    }
}

impl StatusProgressStorage {
    fn path<'a>(&'a self, key: &'a str) -> [&'a str; 4] {
        ["status", self.field.as_str(), "progress", key]
    }
}

impl ProgressStorage for StatusProgressStorage {
    fn fetch(&self, key: &str, body: &Body) -> StorageResult<Option<ProgressRecord>> {
        let path: Vec<String> = self.path(key).iter().map(|s| s.to_string()).collect();
        match body.field(&path) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|source| StorageError::Malformed { key: path.join("."), source }),
        }
    }

    fn store(&self, key: &str, record: &ProgressRecord, _body: &Body, patch: &mut Patch) {
        patch.set(&self.path(key), serde_json::to_value(record).unwrap_or(Value::Null));
        counter!("persist_progress_stored_total", 1u64);
    }

    fn purge(&self, key: &str, body: &Body, patch: &mut Patch) {
        let path: Vec<String> = self.path(key).iter().map(|s| s.to_string()).collect();
        if body.field(&path).is_some() {
            patch.set(&self.path(key), Value::Null);
        }
    }

    fn touch(&self, body: &Body, patch: &mut Patch, value: Option<&str>) {
        let path = ["status", self.field.as_str(), "dummy"];
        let owned: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        let current = body.field(&owned);
        if current.as_ref().and_then(Value::as_str) != value {
            patch.set(&path, value.map(|s| Value::String(s.to_string())).unwrap_or(Value::Null));
        }
    }

    fn clear(&self, mut essence: Value) -> Value {
        if let Some(status) = essence.get_mut("status").and_then(Value::as_object_mut) {
            status.remove(&self.field);
        }
        essence
    }
}

/// Reads from annotations first, then status; writes to both. Lets objects
/// handled by either layout keep their progress when the layout changes.
#[derive(Debug, Clone, Default)]
pub struct SmartProgressStorage {
    pub annotations: AnnotationsProgressStorage,
    pub status: StatusProgressStorage,
}

impl ProgressStorage for SmartProgressStorage {
    fn fetch(&self, key: &str, body: &Body) -> StorageResult<Option<ProgressRecord>> {
        match self.annotations.fetch(key, body)? {
            Some(record) => Ok(Some(record)),
            None => self.status.fetch(key, body),
        }
    }

    fn store(&self, key: &str, record: &ProgressRecord, body: &Body, patch: &mut Patch) {
        self.annotations.store(key, record, body, patch);
        self.status.store(key, record, body, patch);
    }

    fn purge(&self, key: &str, body: &Body, patch: &mut Patch) {
        self.annotations.purge(key, body, patch);
        self.status.purge(key, body, patch);
    }

    fn touch(&self, body: &Body, patch: &mut Patch, value: Option<&str>) {
        self.annotations.touch(body, patch, value);
        self.status.touch(body, patch, value);
    }

    fn clear(&self, essence: Value) -> Value {
        self.status.clear(self.annotations.clear(essence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record() -> ProgressRecord {
        ProgressRecord {
            started: Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()),
            purpose: Some("create".into()),
            retries: 2,
            message: Some("boom".into()),
            ..Default::default()
        }
    }

    fn roundtrip(storage: &dyn ProgressStorage) {
        let body = Body::new(json!({"metadata": {"name": "a"}}));
        let mut patch = Patch::new();
        storage.store("create_fn", &record(), &body, &mut patch);
        body.replace(patch.apply_to(&body.snapshot()));
        assert_eq!(storage.fetch("create_fn", &body).unwrap(), Some(record()));
        assert_eq!(storage.fetch("other_fn", &body).unwrap(), None);

        let mut patch = Patch::new();
        storage.purge("create_fn", &body, &mut patch);
        body.replace(patch.apply_to(&body.snapshot()));
        assert_eq!(storage.fetch("create_fn", &body).unwrap(), None);
    }

    #[test]
    fn annotations_store_fetch_purge() {
        roundtrip(&AnnotationsProgressStorage::default());
    }

    #[test]
    fn status_store_fetch_purge() {
        roundtrip(&StatusProgressStorage::default());
    }

    #[test]
    fn smart_reads_status_when_annotations_are_absent() {
        let body = Body::new(json!({"metadata": {"name": "a"}}));
        let mut patch = Patch::new();
        StatusProgressStorage::default().store("fn", &record(), &body, &mut patch);
        body.replace(patch.apply_to(&body.snapshot()));
        let smart = SmartProgressStorage::default();
        assert_eq!(smart.fetch("fn", &body).unwrap(), Some(record()));
    }

    #[test]
    fn malformed_annotation_is_an_error() {
        let body = Body::new(json!({"metadata": {"annotations": {"kreact.dev/fn": "not json"}}}));
        let err = AnnotationsProgressStorage::default().fetch("fn", &body).unwrap_err();
        assert!(err.to_string().contains("kreact.dev/fn"));
    }

    #[test]
    fn touch_only_patches_on_change() {
        let storage = AnnotationsProgressStorage::default();
        let body = Body::new(json!({"metadata": {"annotations": {"kreact.dev/touch-dummy": "1"}}}));
        let mut patch = Patch::new();
        storage.touch(&body, &mut patch, Some("1"));
        assert!(patch.is_empty());
        storage.touch(&body, &mut patch, Some("2"));
        assert_eq!(patch.as_value()["metadata"]["annotations"]["kreact.dev/touch-dummy"], "2");
    }

    #[test]
    fn clear_drops_own_fields_from_essence() {
        let essence = json!({
            "metadata": {"annotations": {"kreact.dev/fn": "{}", "team": "a"}},
            "status": {"kreact": {"progress": {}}, "phase": "Ready"}
        });
        let cleared = SmartProgressStorage::default().clear(essence);
        assert_eq!(cleared["metadata"]["annotations"], json!({"team": "a"}));
        assert_eq!(cleared["status"], json!({"phase": "Ready"}));
    }
}
