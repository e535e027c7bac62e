use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// One watch notification. `event_type == None` marks objects synthesized from
/// the initial listing rather than streamed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: Option<EventType>,
    pub object: Value,
}

impl RawEvent {
    pub fn listed(object: Value) -> Self {
        Self { event_type: None, object }
    }

    pub fn new(event_type: EventType, object: Value) -> Self {
        Self { event_type: Some(event_type), object }
    }

    pub fn is_deleted(&self) -> bool {
        self.event_type == Some(EventType::Deleted)
    }

    pub fn resource_version(&self) -> Option<&str> {
        meta_str(&self.object, "resourceVersion")
    }
}

pub fn meta_str<'a>(raw: &'a Value, field: &str) -> Option<&'a str> {
    raw.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
}

/// Stable per-object key: the uid when present, otherwise a composite of the
/// identifying fields, so weakly identified objects still get their own stream.
pub fn object_key(raw: &Value) -> String {
    if let Some(uid) = meta_str(raw, "uid") {
        return uid.to_string();
    }
    let kind = raw.get("kind").and_then(|v| v.as_str()).unwrap_or("");
    let api_version = raw.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
    let namespace = meta_str(raw, "namespace").unwrap_or("");
    let name = meta_str(raw, "name").unwrap_or("");
    let created = meta_str(raw, "creationTimestamp").unwrap_or("");
    format!("{kind}/{api_version}/{namespace}/{name}/{created}")
}

/// Live view of an object's last known state.
///
/// Cloning shares the same cell: the per-object worker replaces the content on
/// every fresher event and every clone (daemons, timers) observes it at once.
#[derive(Debug, Clone)]
pub struct Body {
    cell: Arc<ArcSwap<Value>>,
}

impl Body {
    pub fn new(raw: Value) -> Self {
        Self { cell: Arc::new(ArcSwap::from_pointee(raw)) }
    }

    pub fn replace(&self, raw: Value) {
        self.cell.store(Arc::new(raw));
    }

    pub fn snapshot(&self) -> Arc<Value> {
        self.cell.load_full()
    }

    pub fn shares_cell_with(&self, other: &Body) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    fn meta_string(&self, field: &str) -> Option<String> {
        meta_str(&self.cell.load(), field).map(str::to_string)
    }

    pub fn uid(&self) -> Option<String> {
        self.meta_string("uid")
    }

    pub fn name(&self) -> Option<String> {
        self.meta_string("name")
    }

    pub fn namespace(&self) -> Option<String> {
        self.meta_string("namespace")
    }

    pub fn resource_version(&self) -> Option<String> {
        self.meta_string("resourceVersion")
    }

    pub fn deletion_timestamp(&self) -> Option<String> {
        self.meta_string("deletionTimestamp")
    }

    pub fn key(&self) -> String {
        object_key(&self.cell.load())
    }

    pub fn finalizers(&self) -> Vec<String> {
        self.cell
            .load()
            .get("metadata")
            .and_then(|m| m.get("finalizers"))
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    pub fn label(&self, key: &str) -> Option<String> {
        self.meta_map_value("labels", key)
    }

    pub fn annotation(&self, key: &str) -> Option<String> {
        self.meta_map_value("annotations", key)
    }

    fn meta_map_value(&self, map: &str, key: &str) -> Option<String> {
        self.cell
            .load()
            .get("metadata")
            .and_then(|m| m.get(map))
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Resolve a dotted field path against the current content.
    pub fn field(&self, path: &[String]) -> Option<Value> {
        let snap = self.cell.load();
        let mut cur: &Value = &snap;
        for part in path {
            cur = cur.get(part.as_str())?;
        }
        Some(cur.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_prefers_uid_and_falls_back_to_identity() {
        let with_uid = json!({"metadata": {"uid": "u-1", "name": "a"}});
        assert_eq!(object_key(&with_uid), "u-1");

        let weak = json!({
            "kind": "Widget", "apiVersion": "example.com/v1",
            "metadata": {"name": "a", "namespace": "ns", "creationTimestamp": "2020-01-01T00:00:00Z"}
        });
        assert_eq!(object_key(&weak), "Widget/example.com/v1/ns/a/2020-01-01T00:00:00Z");
    }

    #[test]
    fn clones_observe_replacements() {
        let body = Body::new(json!({"metadata": {"name": "a"}, "spec": {"x": 1}}));
        let seen_by_daemon = body.clone();
        body.replace(json!({"metadata": {"name": "a"}, "spec": {"x": 2}}));
        assert_eq!(seen_by_daemon.field(&["spec".into(), "x".into()]), Some(json!(2)));
        assert!(seen_by_daemon.shares_cell_with(&body));
    }

    #[test]
    fn raw_event_wire_format() {
        let ev: RawEvent = serde_json::from_value(json!({"type": "MODIFIED", "object": {}})).unwrap();
        assert_eq!(ev.event_type, Some(EventType::Modified));
        let listed: RawEvent = serde_json::from_value(json!({"type": null, "object": {}})).unwrap();
        assert_eq!(listed.event_type, None);
        assert!(!listed.is_deleted());
    }
}
