use std::time::Instant;

use futures::TryStreamExt;
use kube::{
    api::{Api, ListParams, Patch as KubePatch, PatchParams, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use kreact_core::bodies::{EventType, RawEvent};
use kreact_core::patches::Patch;
use kreact_core::resources::Resource;
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::retries::{transport, with_retries, RetryPolicy};
use crate::{ApiClient, ClientError, ClientResult};

/// `ApiClient` over kube-rs dynamic objects.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    retry: RetryPolicy,
    /// Server-side watch timeout; the stream ends cleanly after it and is resumed.
    watch_timeout_secs: u32,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client, retry: RetryPolicy::default(), watch_timeout_secs: 290 }
    }

    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = secs;
        self
    }

    fn api(&self, resource: &Resource, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(resource);
        match (resource.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn api_resource(resource: &Resource) -> ApiResource {
    ApiResource {
        group: resource.group.clone(),
        version: resource.version.clone(),
        api_version: resource.api_version(),
        kind: resource.kind.clone(),
        plural: resource.plural.clone(),
    }
}

fn classify(e: kube::Error) -> ClientError {
    match e {
        kube::Error::Api(resp) if resp.code == 410 => ClientError::Gone(resp.message),
        kube::Error::Api(resp) => ClientError::Api { code: resp.code, message: resp.message },
        other => transport(other),
    }
}

/// Serialize an object, restoring `apiVersion`/`kind` which list items may omit.
fn to_raw(obj: &DynamicObject, resource: &Resource) -> ClientResult<Value> {
    let mut raw = serde_json::to_value(obj)?;
    if let Some(map) = raw.as_object_mut() {
        map.entry("apiVersion").or_insert_with(|| Value::String(resource.api_version()));
        map.entry("kind").or_insert_with(|| Value::String(resource.kind.clone()));
    }
    Ok(raw)
}

#[async_trait::async_trait]
impl ApiClient for KubeClient {
    async fn list(&self, resource: &Resource, namespace: Option<&str>) -> ClientResult<(Vec<Value>, Option<String>)> {
        let t0 = Instant::now();
        let api = &self.api(resource, namespace);
        let lp = &ListParams::default();
        let list = with_retries(&self.retry, "list", || async move { api.list(lp).await.map_err(classify) })
        .await?;
        let mut out = Vec::with_capacity(list.items.len());
        for obj in list.items.iter() {
            out.push(to_raw(obj, resource)?);
        }
        histogram!("kubehub_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(resource = %resource, count = out.len(), "listed");
        Ok((out, list.metadata.resource_version))
    }

    async fn watch(
        &self,
        resource: &Resource,
        namespace: Option<&str>,
        since: Option<&str>,
        tx: &mpsc::Sender<RawEvent>,
    ) -> ClientResult<Option<String>> {
        let api = &self.api(resource, namespace);
        let wp = &WatchParams::default().timeout(self.watch_timeout_secs);
        let version = since.unwrap_or("0");
        let stream = with_retries(&self.retry, "watch", || async move { api.watch(wp, version).await.map_err(classify) }).await?;
        futures::pin_mut!(stream);
        debug!(resource = %resource, since = %version, "watch stream opened");
        let mut last = since.map(str::to_string);
        while let Some(ev) = stream.try_next().await.map_err(classify)? {
            let (event_type, obj) = match ev {
                WatchEvent::Added(o) => (EventType::Added, o),
                WatchEvent::Modified(o) => (EventType::Modified, o),
                WatchEvent::Deleted(o) => (EventType::Deleted, o),
                WatchEvent::Bookmark(b) => {
                    last = Some(b.metadata.resource_version);
                    continue;
                }
                WatchEvent::Error(resp) if resp.code == 410 => return Err(ClientError::Gone(resp.message)),
                WatchEvent::Error(resp) => return Err(ClientError::Api { code: resp.code, message: resp.message }),
            };
            if let Some(rv) = obj.metadata.resource_version.clone() {
                last = Some(rv);
            }
            counter!("kubehub_watch_events_total", 1u64);
            if tx.send(RawEvent::new(event_type, to_raw(&obj, resource)?)).await.is_err() {
                // The consumer is gone: nobody to deliver to.
                break;
            }
        }
        debug!(resource = %resource, "watch stream ended");
        Ok(last)
    }

    async fn patch(
        &self,
        resource: &Resource,
        namespace: Option<&str>,
        name: &str,
        patch: &Patch,
    ) -> ClientResult<Option<Value>> {
        let t0 = Instant::now();
        let api = &self.api(resource, namespace);
        let pp = &PatchParams::default();
        let (main, status) = if resource.has_subresource("status") {
            patch.split_status()
        } else {
            (Some(patch.as_value()), None)
        };
        let mut latest: Option<DynamicObject> = None;
        if let Some(body) = main {
            let body = &body;
            let res = with_retries(&self.retry, "patch", || async move {
                api.patch(name, pp, &KubePatch::Merge(body)).await.map_err(classify)
            })
            .await;
            match res {
                Ok(obj) => latest = Some(obj),
                Err(ClientError::Api { code: 404, .. }) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        if let Some(body) = status {
            let body = &body;
            let res = with_retries(&self.retry, "patch_status", || async move {
                api.patch_status(name, pp, &KubePatch::Merge(body)).await.map_err(classify)
            })
            .await;
            match res {
                Ok(obj) => latest = Some(obj),
                Err(ClientError::Api { code: 404, .. }) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        histogram!("kubehub_patch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("kubehub_patches_total", 1u64);
        latest.map(|o| to_raw(&o, resource)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_resource_mirrors_the_descriptor() {
        let r = Resource::new("example.com", "v1", "widgets", "Widget", true);
        let ar = api_resource(&r);
        assert_eq!(ar.api_version, "example.com/v1");
        assert_eq!(ar.plural, "widgets");
        assert_eq!(ar.kind, "Widget");
    }

    #[test]
    fn to_raw_fills_type_meta() {
        let r = Resource::new("", "v1", "configmaps", "ConfigMap", true);
        let ar = api_resource(&r);
        let mut obj = DynamicObject::new("cm", &ar);
        obj.types = None;
        let raw = to_raw(&obj, &r).unwrap();
        assert_eq!(raw["apiVersion"], "v1");
        assert_eq!(raw["kind"], "ConfigMap");
        assert_eq!(raw["metadata"]["name"], "cm");
    }
}
