//! One calling convention for every handler.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use anyhow::anyhow;
use futures::FutureExt;
use tokio::task::JoinError;

use crate::context::HandlerContext;
use crate::errors::{HandlerError, HandlerResult};
use crate::handlers::HandlerFn;

/// Call the handler. Async handlers run in place; synchronous ones run on the
/// blocking pool so they cannot stall other objects. A blocking body cannot be
/// killed; callers await it to the end.
///
/// Panics become arbitrary errors.
pub async fn invoke(func: &HandlerFn, ctx: HandlerContext) -> HandlerResult {
    match func {
        HandlerFn::Async(f) => {
            let f = f.clone();
            match AssertUnwindSafe(async move { f(ctx).await }).catch_unwind().await {
                Ok(res) => res,
                Err(panic) => Err(HandlerError::Other(anyhow!("handler panicked: {}", panic_message(&*panic)))),
            }
        }
        HandlerFn::Sync(f) => {
            let f = f.clone();
            match tokio::task::spawn_blocking(move || f(ctx)).await {
                Ok(res) => res,
                Err(e) => Err(join_failure(e)),
            }
        }
    }
}

/// A panicking body is an arbitrary error; a cancelled one is final.
fn join_failure(e: JoinError) -> HandlerError {
    if e.is_panic() {
        HandlerError::Other(anyhow!("handler panicked: {}", panic_message(&*e.into_panic())))
    } else {
        HandlerError::Cancelled(e.to_string())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CauseInfo, Memo};
    use crate::indexing::Indices;
    use kreact_core::bodies::Body;
    use serde_json::json;

    fn ctx() -> HandlerContext {
        HandlerContext::new("h", Body::new(json!({})), CauseInfo::Indexing, Memo::default(), Indices::new())
    }

    #[tokio::test]
    async fn async_and_blocking_handlers_share_the_convention() {
        let a = HandlerFn::new(|ctx: HandlerContext| async move { Ok(Some(json!(ctx.handler_id))) });
        let s = HandlerFn::blocking(|_ctx| Ok(Some(json!("sync"))));
        assert_eq!(invoke(&a, ctx()).await.unwrap(), Some(json!("h")));
        assert_eq!(invoke(&s, ctx()).await.unwrap(), Some(json!("sync")));
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let a = HandlerFn::new(|_ctx| async { panic!("boom") });
        let s = HandlerFn::blocking(|_ctx| panic!("bang"));
        let ea = invoke(&a, ctx()).await.unwrap_err();
        let es = invoke(&s, ctx()).await.unwrap_err();
        assert!(ea.to_string().contains("boom"));
        assert!(es.to_string().contains("bang"));
    }

    #[tokio::test]
    async fn cancelled_tasks_are_never_retried() {
        let task = tokio::spawn(std::future::pending::<()>());
        task.abort();
        let err = join_failure(task.await.unwrap_err());
        assert!(matches!(err, HandlerError::Cancelled(_)));
        assert!(err.is_fatal());
    }
}
