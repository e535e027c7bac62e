//! Deletion markers: the operator's finalizer blocks physical deletion until
//! everything that must happen at the end of the object's life is done.

use crate::bodies::Body;
use crate::patches::Patch;

pub fn is_deletion_ongoing(body: &Body) -> bool {
    body.deletion_timestamp().is_some()
}

pub fn is_deletion_blocked(body: &Body, finalizer: &str) -> bool {
    body.finalizers().iter().any(|f| f == finalizer)
}

pub fn block_deletion(body: &Body, patch: &mut Patch, finalizer: &str) {
    let mut finalizers = body.finalizers();
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
        patch.set_finalizers(finalizers);
    }
}

pub fn allow_deletion(body: &Body, patch: &mut Patch, finalizer: &str) {
    let finalizers = body.finalizers();
    if finalizers.iter().any(|f| f == finalizer) {
        patch.set_finalizers(finalizers.into_iter().filter(|f| f != finalizer).collect());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn block_and_allow_keep_foreign_finalizers() {
        let body = Body::new(json!({"metadata": {"finalizers": ["other/x"]}}));
        let mut p = Patch::new();
        block_deletion(&body, &mut p, "kreact.dev/finalizer");
        assert_eq!(p.as_value()["metadata"]["finalizers"], json!(["other/x", "kreact.dev/finalizer"]));

        body.replace(p.apply_to(&body.snapshot()));
        assert!(is_deletion_blocked(&body, "kreact.dev/finalizer"));
        let mut p = Patch::new();
        allow_deletion(&body, &mut p, "kreact.dev/finalizer");
        assert_eq!(p.as_value()["metadata"]["finalizers"], json!(["other/x"]));
    }

    #[test]
    fn no_op_when_already_in_the_desired_state() {
        let body = Body::new(json!({"metadata": {"deletionTimestamp": "2020-01-01T00:00:00Z"}}));
        let mut p = Patch::new();
        allow_deletion(&body, &mut p, "f");
        assert!(p.is_empty());
        assert!(is_deletion_ongoing(&body));
    }
}
