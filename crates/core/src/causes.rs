//! Cause detection: turning a raw event plus the stored essence into the one
//! semantic reason of a handling cycle.
//!
//! The detection is pure and total. Rules are checked in order, first match wins:
//!
//! | # | condition                                   | reason   |
//! |---|---------------------------------------------|----------|
//! | 1 | event type is `DELETED`                     | `Gone`   |
//! | 2 | deletion requested, our finalizer is absent | `Free`   |
//! | 3 | deletion requested                          | `Delete` |
//! | 4 | no essence stored yet                       | `Create` |
//! | 5 | empty diff on the first cycle after start   | `Resume` |
//! | 6 | empty diff                                  | `Noop`   |
//! | 7 | otherwise                                   | `Update` |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bodies::{Body, EventType};
use crate::diffs::{diff, Diff};
use crate::finalizers::{is_deletion_blocked, is_deletion_ongoing};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Reason {
    Create,
    Update,
    Delete,
    Resume,
    Noop,
    Free,
    Gone,
}

impl Reason {
    /// Reasons for which user handlers are invoked.
    pub const HANDLED: [Reason; 4] = [Reason::Create, Reason::Update, Reason::Delete, Reason::Resume];

    pub fn is_handled(self) -> bool {
        Self::HANDLED.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Create => "create",
            Reason::Update => "update",
            Reason::Delete => "delete",
            Reason::Resume => "resume",
            Reason::Noop => "noop",
            Reason::Free => "free",
            Reason::Gone => "gone",
        }
    }

    /// Gerund used in log lines: "Creation is processed".
    pub fn title(self) -> &'static str {
        match self {
            Reason::Create => "creation",
            Reason::Update => "update",
            Reason::Delete => "deletion",
            Reason::Resume => "resuming",
            Reason::Noop => "no-op",
            Reason::Free => "freeing",
            Reason::Gone => "disappearance",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The primitive facts the detector decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CauseFacts {
    pub event_type: Option<EventType>,
    pub deletion_ongoing: bool,
    pub finalizer_present: bool,
    pub essence_stored: bool,
    pub diff_empty: bool,
    pub initial: bool,
}

pub fn detect_reason(facts: CauseFacts) -> Reason {
    if facts.event_type == Some(EventType::Deleted) {
        Reason::Gone
    } else if facts.deletion_ongoing && !facts.finalizer_present {
        Reason::Free
    } else if facts.deletion_ongoing {
        Reason::Delete
    } else if !facts.essence_stored {
        Reason::Create
    } else if facts.diff_empty && facts.initial {
        Reason::Resume
    } else if facts.diff_empty {
        Reason::Noop
    } else {
        Reason::Update
    }
}

#[derive(Debug, Clone)]
pub struct ChangingCause {
    pub reason: Reason,
    /// First cycle for this object since the process started (noticed by listing).
    pub initial: bool,
    pub body: Body,
    pub diff: Diff,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

pub fn detect_changing_cause(
    event_type: Option<EventType>,
    body: &Body,
    old: Option<Value>,
    new: Option<Value>,
    finalizer: &str,
    initial: bool,
) -> ChangingCause {
    let d = diff(old.as_ref(), new.as_ref());
    let reason = detect_reason(CauseFacts {
        event_type,
        deletion_ongoing: is_deletion_ongoing(body),
        finalizer_present: is_deletion_blocked(body, finalizer),
        essence_stored: old.is_some(),
        diff_empty: d.is_empty(),
        initial,
    });
    ChangingCause { reason, initial, body: body.clone(), diff: d, old, new }
}

/// Every event, as is, for fire-and-forget watching handlers.
#[derive(Debug, Clone)]
pub struct WatchingCause {
    pub event_type: Option<EventType>,
    pub body: Body,
}

/// Daemon and timer decisions; `reset` is set on the first sight of an object.
#[derive(Debug, Clone)]
pub struct SpawningCause {
    pub body: Body,
    pub reset: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diffs::{field_path, DiffOperation};
    use serde_json::json;

    fn all_facts() -> Vec<CauseFacts> {
        let mut out = Vec::new();
        let types = [None, Some(EventType::Added), Some(EventType::Modified), Some(EventType::Deleted)];
        for event_type in types {
            for bits in 0u8..32 {
                out.push(CauseFacts {
                    event_type,
                    deletion_ongoing: bits & 1 != 0,
                    finalizer_present: bits & 2 != 0,
                    essence_stored: bits & 4 != 0,
                    diff_empty: bits & 8 != 0,
                    initial: bits & 16 != 0,
                });
            }
        }
        out
    }

    #[test]
    fn detection_is_deterministic_and_never_creates_over_stored_essence() {
        for facts in all_facts() {
            let reason = detect_reason(facts);
            assert_eq!(reason, detect_reason(facts));
            if facts.essence_stored {
                assert_ne!(reason, Reason::Create, "{facts:?}");
            }
        }
    }

    #[test]
    fn deletion_wins_over_a_stale_resume_flag() {
        let facts = CauseFacts {
            event_type: None,
            deletion_ongoing: true,
            finalizer_present: true,
            essence_stored: true,
            diff_empty: true,
            initial: true,
        };
        assert_eq!(detect_reason(facts), Reason::Delete);
        assert_eq!(detect_reason(CauseFacts { finalizer_present: false, ..facts }), Reason::Free);
        assert_eq!(detect_reason(CauseFacts { event_type: Some(EventType::Deleted), ..facts }), Reason::Gone);
    }

    #[test]
    fn resume_never_masquerades_as_create() {
        let body = Body::new(json!({"metadata": {"name": "a"}, "spec": {"field": 1}}));
        let cause = detect_changing_cause(None, &body, None, Some(json!({"spec": {"field": 1}})), "f", true);
        assert_eq!(cause.reason, Reason::Create);
        let essence = json!({"spec": {"field": 1}});
        let cause = detect_changing_cause(None, &body, Some(essence.clone()), Some(essence), "f", true);
        assert_eq!(cause.reason, Reason::Resume);
    }

    #[test]
    fn create_noop_update_sequence() {
        let body = Body::new(json!({"metadata": {"name": "a"}, "spec": {"field": 1}}));
        let v1 = json!({"spec": {"field": 1}});
        let v2 = json!({"spec": {"field": 2}});

        let c1 = detect_changing_cause(Some(EventType::Added), &body, None, Some(v1.clone()), "f", false);
        assert_eq!(c1.reason, Reason::Create);

        let c2 = detect_changing_cause(Some(EventType::Modified), &body, Some(v1.clone()), Some(v1.clone()), "f", false);
        assert_eq!(c2.reason, Reason::Noop);

        let c3 = detect_changing_cause(Some(EventType::Modified), &body, Some(v1), Some(v2), "f", false);
        assert_eq!(c3.reason, Reason::Update);
        assert_eq!(c3.diff.len(), 1);
        let item = &c3.diff.0[0];
        assert_eq!(item.operation, DiffOperation::Change);
        assert_eq!(item.field, field_path("spec.field"));
        assert_eq!(item.old, Some(json!(1)));
        assert_eq!(item.new, Some(json!(2)));
    }
}
