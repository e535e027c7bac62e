//! Handlers for the `KopfExample` custom resource, one of each kind.

use std::time::Duration;

use kreact_core::resources::Resource;
use kreact_execution::{
    ChangingHandler, HandlerContext, HandlerError, HandlerFn, HandlerOptions, IndexingHandler, Registry,
    RegistryError, SpawningHandler, WatchingHandler,
};
use metrics::counter;
use serde_json::{json, Map, Value};
use tracing::info;

pub fn resource() -> Resource {
    Resource::new("kopf.dev", "v1", "kopfexamples", "KopfExample", true).with_subresources(["status"])
}

pub fn registry() -> Result<Registry, RegistryError> {
    let r = resource();
    let mut registry = Registry::new();

    registry.register(
        &r,
        ChangingHandler::on_create(
            "create_fn",
            HandlerFn::new(|ctx: HandlerContext| async move {
                let field = ctx.body.field(&["spec".into(), "field".into()]);
                info!(?field, retry = ctx.retry, "object created");
                Ok(Some(json!({"message": "hello world"})))
            }),
        )
        .timeout(Duration::from_secs(60)),
    )?;

    registry.register(
        &r,
        ChangingHandler::on_update(
            "update_fn",
            HandlerFn::new(|ctx: HandlerContext| async move {
                let changes = ctx.diff().map_or(0, |d| d.len());
                info!(changes, "object updated");
                Ok(None)
            }),
        ),
    )?;

    registry.register(
        &r,
        ChangingHandler::on_field(
            "field_fn",
            "spec.field",
            HandlerFn::new(|ctx: HandlerContext| async move {
                match ctx.new_essence().and_then(|e| e.pointer("/spec/field")).cloned() {
                    Some(Value::String(s)) if s.is_empty() => Err(HandlerError::permanent("spec.field must not be empty")),
                    value => {
                        info!(?value, "field changed");
                        Ok(None)
                    }
                }
            }),
        )
        .retries(3)
        .backoff(Duration::from_secs(10)),
    )?;

    registry.register(
        &r,
        ChangingHandler::on_delete(
            "delete_fn",
            HandlerFn::blocking(|ctx| {
                info!(name = ?ctx.body.name(), "object being deleted");
                Ok(None)
            }),
        ),
    )?;

    registry.register(
        &r,
        SpawningHandler::daemon(
            "monitor",
            HandlerFn::new(|ctx: HandlerContext| async move {
                let Some(stopper) = ctx.stopper.clone() else { return Ok(None) };
                loop {
                    let field = ctx.body.field(&["spec".into(), "field".into()]);
                    info!(?field, "monitoring");
                    if stopper.sleep(Duration::from_secs(30)).await {
                        return Ok(None);
                    }
                }
            }),
        )
        .cancellation(Some(Duration::from_secs(5)), Some(Duration::from_secs(10))),
    )?;

    registry.register(
        &r,
        SpawningHandler::timer(
            "tick",
            Duration::from_secs(60),
            HandlerFn::new(|ctx: HandlerContext| async move {
                counter!("demo_ticks_total", 1u64);
                let peers = ctx.indices.get("by_namespace", &ctx.body.namespace().unwrap_or_default()).len();
                info!(peers, "tick");
                Ok(None)
            }),
        )
        .sharp(),
    )?;

    registry.register(
        &r,
        IndexingHandler::new(
            "by_namespace",
            HandlerFn::new(|ctx: HandlerContext| async move {
                let mut entry = Map::new();
                entry.insert(ctx.body.namespace().unwrap_or_default(), json!(ctx.body.name()));
                Ok(Some(Value::Object(entry)))
            }),
        ),
    )?;

    registry.register(
        &r,
        WatchingHandler::new(
            "event_fn",
            HandlerFn::new(|ctx: HandlerContext| async move {
                tracing::debug!(event = ?ctx.event_type(), "event received");
                Ok(None)
            }),
        ),
    )?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_is_registered_once() {
        let registry = registry().unwrap();
        let handlers = registry.handlers(&resource()).unwrap();
        assert_eq!(handlers.changing.len(), 4);
        assert_eq!(handlers.spawning.len(), 2);
        assert_eq!(handlers.indexing.len(), 1);
        assert_eq!(handlers.watching.len(), 1);
    }
}
