//! The essence of an object: what the operator cares about, without the fields
//! the server or the framework itself keep changing.

use kreact_core::diffs::FieldPath;
use serde_json::{Map, Value};

const SYSTEM_METADATA: &[&str] = &[
    "uid",
    "selfLink",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "finalizers",
    "managedFields",
];

const FOREIGN_ANNOTATIONS: &[&str] = &["kubectl.kubernetes.io/last-applied-configuration"];

/// Strip system metadata, status and the framework's own annotations (those
/// under `own_prefix/`), then prune empty maps. `extra_fields` are carried over
/// from the body even if they would be stripped (e.g. selected status fields).
pub fn build(body: &Value, own_prefix: &str, extra_fields: &[FieldPath]) -> Value {
    let mut v = body.clone();
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    if let Some(meta) = v.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in SYSTEM_METADATA {
            meta.remove(*field);
        }
        if let Some(annotations) = meta.get_mut("annotations").and_then(Value::as_object_mut) {
            let own = format!("{own_prefix}/");
            annotations.retain(|k, _| !FOREIGN_ANNOTATIONS.contains(&k.as_str()) && !k.starts_with(&own));
        }
    }
    for path in extra_fields {
        if let Some(value) = lookup(body, path) {
            insert(&mut v, path, value.clone());
        }
    }
    prune_empty(&mut v);
    v
}

fn lookup<'a>(v: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(v, |cur, part| cur.get(part.as_str()))
}

fn insert(v: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else { return };
    let mut cur = v;
    for part in parents {
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        let Value::Object(map) = cur else { return };
        cur = map.entry(part.clone()).or_insert_with(|| Value::Object(Map::new()));
    }
    if let Value::Object(map) = cur {
        map.insert(last.clone(), value);
    }
}

/// Drop empty maps bottom-up; the top level stays a map even when empty.
fn prune_empty(v: &mut Value) {
    if let Value::Object(map) = v {
        for child in map.values_mut() {
            prune_empty(child);
        }
        map.retain(|_, child| !matches!(child, Value::Object(m) if m.is_empty()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kreact_core::diffs::{diff, field_path};
    use serde_json::json;

    fn noisy() -> Value {
        json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "uid": "u-1",
                "managedFields": [{"foo": "bar"}],
                "resourceVersion": "123",
                "generation": 5,
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "finalizers": ["kreact.dev/finalizer"],
                "annotations": {
                    "kreact.dev/create_fn": "{\"retries\":1}",
                    "kubectl.kubernetes.io/last-applied-configuration": "{}"
                },
                "labels": {}
            },
            "spec": {"replicas": 3, "template": {}},
            "status": {"observed": true}
        })
    }

    #[test]
    fn strips_system_fields_and_own_bookkeeping() {
        let e = build(&noisy(), "kreact.dev", &[]);
        let meta = e["metadata"].as_object().unwrap();
        for gone in ["uid", "managedFields", "resourceVersion", "generation", "creationTimestamp", "finalizers"] {
            assert!(!meta.contains_key(gone), "{gone} must be stripped");
        }
        assert!(!meta.contains_key("annotations"), "emptied annotations are pruned");
        assert!(!meta.contains_key("labels"));
        assert!(e.get("status").is_none());
        assert_eq!(e["spec"], json!({"replicas": 3}));
        assert_eq!(meta["name"], "x");
    }

    #[test]
    fn foreign_annotations_survive() {
        let mut body = noisy();
        body["metadata"]["annotations"]["team"] = json!("a");
        let e = build(&body, "kreact.dev", &[]);
        assert_eq!(e["metadata"]["annotations"], json!({"team": "a"}));
    }

    #[test]
    fn extra_fields_are_kept() {
        let e = build(&noisy(), "kreact.dev", &[field_path("status.observed")]);
        assert_eq!(e["status"], json!({"observed": true}));
    }

    #[test]
    fn building_is_idempotent() {
        let once = build(&noisy(), "kreact.dev", &[]);
        let twice = build(&once, "kreact.dev", &[]);
        assert_eq!(once, twice);
        assert!(diff(Some(&once), Some(&twice)).is_empty());
    }
}
