use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use kreact_core::bodies::{meta_str, RawEvent};
use kreact_core::patches::Patch;
use kreact_core::resources::Resource;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{ApiClient, ClientError, ClientResult};

/// In-memory cluster for tests: applies merge patches the way the server does,
/// records them, and serves scripted watch streams.
pub struct MockClient {
    state: Mutex<MockState>,
}

#[derive(Debug, Clone)]
pub struct RecordedPatch {
    pub namespace: Option<String>,
    pub name: String,
    pub patch: Value,
}

enum Script {
    Events(Vec<RawEvent>),
    Expiry,
}

#[derive(Default)]
struct MockState {
    objects: BTreeMap<(String, String), Value>,
    last_rv: u64,
    patches: Vec<RecordedPatch>,
    scripts: VecDeque<Script>,
    list_calls: usize,
    failing_patches: usize,
}

impl MockState {
    fn bump(&mut self, obj: &mut Value) -> String {
        self.last_rv += 1;
        let rv = self.last_rv.to_string();
        obj["metadata"]["resourceVersion"] = Value::String(rv.clone());
        rv
    }
}

fn key_of(obj: &Value) -> (String, String) {
    (meta_str(obj, "namespace").unwrap_or("").to_string(), meta_str(obj, "name").unwrap_or("").to_string())
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClient {
    pub fn new() -> Self {
        Self { state: Mutex::new(MockState::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store an object, assigning a uid and a fresh resource version.
    pub fn insert(&self, mut obj: Value) -> Value {
        if !obj["metadata"].is_object() {
            obj["metadata"] = Value::Object(Default::default());
        }
        if meta_str(&obj, "uid").is_none() {
            obj["metadata"]["uid"] = Value::String(uuid::Uuid::new_v4().to_string());
        }
        let mut st = self.lock();
        st.bump(&mut obj);
        st.objects.insert(key_of(&obj), obj.clone());
        obj
    }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<Value> {
        self.lock().objects.get(&(namespace.unwrap_or("").to_string(), name.to_string())).cloned()
    }

    /// Request deletion: mark the object if finalizers hold it, drop it otherwise.
    pub fn delete(&self, namespace: Option<&str>, name: &str) -> Option<Value> {
        let mut st = self.lock();
        let key = (namespace.unwrap_or("").to_string(), name.to_string());
        let mut obj = st.objects.get(&key).cloned()?;
        if finalizers_of(&obj).is_empty() {
            st.objects.remove(&key);
            return Some(obj);
        }
        obj["metadata"]["deletionTimestamp"] = Value::String("2020-01-01T00:00:00Z".into());
        st.bump(&mut obj);
        st.objects.insert(key, obj.clone());
        Some(obj)
    }

    pub fn patches(&self) -> Vec<RecordedPatch> {
        self.lock().patches.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    /// The next `n` patches fail with a server error.
    pub fn fail_next_patches(&self, n: usize) {
        self.lock().failing_patches = n;
    }

    /// The next watch call delivers these events and ends.
    pub fn script_watch(&self, events: Vec<RawEvent>) {
        self.lock().scripts.push_back(Script::Events(events));
    }

    /// The next watch call fails with an expired resource version.
    pub fn script_expiry(&self) {
        self.lock().scripts.push_back(Script::Expiry);
    }
}

fn finalizers_of(obj: &Value) -> Vec<Value> {
    obj.get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(|f| f.as_array())
        .cloned()
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl ApiClient for MockClient {
    async fn list(&self, _resource: &Resource, namespace: Option<&str>) -> ClientResult<(Vec<Value>, Option<String>)> {
        let mut st = self.lock();
        st.list_calls += 1;
        let items = st
            .objects
            .iter()
            .filter(|((ns, _), _)| namespace.map(|n| n == ns).unwrap_or(true))
            .map(|(_, v)| v.clone())
            .collect();
        Ok((items, Some(st.last_rv.to_string())))
    }

    async fn watch(
        &self,
        _resource: &Resource,
        _namespace: Option<&str>,
        since: Option<&str>,
        tx: &mpsc::Sender<RawEvent>,
    ) -> ClientResult<Option<String>> {
        let script = self.lock().scripts.pop_front();
        match script {
            Some(Script::Events(events)) => {
                let mut last = since.map(str::to_string);
                for ev in events {
                    if let Some(rv) = ev.resource_version() {
                        last = Some(rv.to_string());
                    }
                    if tx.send(ev).await.is_err() {
                        break;
                    }
                }
                Ok(last)
            }
            Some(Script::Expiry) => Err(ClientError::Gone("too old resource version".into())),
            None => {
                futures::future::pending::<()>().await;
                Ok(None)
            }
        }
    }

    async fn patch(
        &self,
        _resource: &Resource,
        namespace: Option<&str>,
        name: &str,
        patch: &Patch,
    ) -> ClientResult<Option<Value>> {
        let mut st = self.lock();
        if st.failing_patches > 0 {
            st.failing_patches -= 1;
            return Err(ClientError::Api { code: 500, message: "injected failure".into() });
        }
        st.patches.push(RecordedPatch {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            patch: patch.as_value(),
        });
        let key = (namespace.unwrap_or("").to_string(), name.to_string());
        let Some(current) = st.objects.get(&key).cloned() else {
            return Ok(None);
        };
        let mut updated = patch.apply_to(&current);
        st.bump(&mut updated);
        let released = updated["metadata"].get("deletionTimestamp").is_some() && finalizers_of(&updated).is_empty();
        if released {
            st.objects.remove(&key);
        } else {
            st.objects.insert(key, updated.clone());
        }
        Ok(Some(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widgets() -> Resource {
        Resource::new("example.com", "v1", "widgets", "Widget", true)
    }

    #[tokio::test]
    async fn patch_applies_and_bumps_version() {
        let mock = MockClient::new();
        let obj = mock.insert(json!({"metadata": {"name": "a", "namespace": "ns"}, "spec": {"x": 1}}));
        let rv0 = meta_str(&obj, "resourceVersion").unwrap().to_string();
        let mut p = Patch::new();
        p.set(&["spec", "x"], json!(2));
        let out = mock.patch(&widgets(), Some("ns"), "a", &p).await.unwrap().unwrap();
        assert_eq!(out["spec"]["x"], 2);
        assert_ne!(meta_str(&out, "resourceVersion").unwrap(), rv0);
        assert_eq!(mock.patches().len(), 1);
    }

    #[tokio::test]
    async fn vanished_objects_patch_to_none() {
        let mock = MockClient::new();
        let out = mock.patch(&widgets(), Some("ns"), "missing", &Patch::new()).await.unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn removing_the_last_finalizer_releases_a_deleted_object() {
        let mock = MockClient::new();
        mock.insert(json!({"metadata": {"name": "a", "namespace": "ns", "finalizers": ["f"]}}));
        let marked = mock.delete(Some("ns"), "a").unwrap();
        assert!(marked["metadata"]["deletionTimestamp"].is_string());
        let mut p = Patch::new();
        p.set_finalizers(vec![]);
        mock.patch(&widgets(), Some("ns"), "a", &p).await.unwrap();
        assert!(mock.get(Some("ns"), "a").is_none());
    }
}
