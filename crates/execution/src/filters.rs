//! Selectors narrowing which objects a handler applies to.

use std::fmt;
use std::sync::Arc;

use kreact_core::bodies::Body;
use kreact_core::diffs::FieldPath;
use serde_json::Value;

/// A condition on one label or annotation.
#[derive(Clone)]
pub enum MetaFilter {
    Present,
    Absent,
    Equals(String),
    Callback(Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>),
}

impl MetaFilter {
    pub fn matches(&self, value: Option<&str>) -> bool {
        match self {
            MetaFilter::Present => value.is_some(),
            MetaFilter::Absent => value.is_none(),
            MetaFilter::Equals(expected) => value == Some(expected.as_str()),
            MetaFilter::Callback(f) => f(value),
        }
    }
}

impl fmt::Debug for MetaFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaFilter::Present => f.write_str("Present"),
            MetaFilter::Absent => f.write_str("Absent"),
            MetaFilter::Equals(v) => write!(f, "Equals({v:?})"),
            MetaFilter::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// A condition on a field value (absent fields are `None`).
#[derive(Clone)]
pub enum ValueFilter {
    Present,
    Absent,
    Equals(Value),
    Callback(Arc<dyn Fn(Option<&Value>) -> bool + Send + Sync>),
}

impl ValueFilter {
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let value = value.filter(|v| !v.is_null());
        match self {
            ValueFilter::Present => value.is_some(),
            ValueFilter::Absent => value.is_none(),
            ValueFilter::Equals(expected) => value == Some(expected),
            ValueFilter::Callback(f) => f(value),
        }
    }
}

impl fmt::Debug for ValueFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueFilter::Present => f.write_str("Present"),
            ValueFilter::Absent => f.write_str("Absent"),
            ValueFilter::Equals(v) => write!(f, "Equals({v})"),
            ValueFilter::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

pub type WhenFn = Arc<dyn Fn(&Body) -> bool + Send + Sync>;

/// All conditions must hold for a handler to apply to an object.
#[derive(Clone, Default)]
pub struct Filters {
    pub labels: Vec<(String, MetaFilter)>,
    pub annotations: Vec<(String, MetaFilter)>,
    /// A field of the body and the condition on its current value.
    pub value: Option<(FieldPath, ValueFilter)>,
    pub when: Option<WhenFn>,
}

impl Filters {
    pub fn matches(&self, body: &Body) -> bool {
        self.labels.iter().all(|(k, f)| f.matches(body.label(k).as_deref()))
            && self.annotations.iter().all(|(k, f)| f.matches(body.annotation(k).as_deref()))
            && self.value.as_ref().map_or(true, |(path, f)| f.matches(body.field(path).as_ref()))
            && self.when.as_ref().map_or(true, |when| when(body))
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty() && self.value.is_none() && self.when.is_none()
    }
}

impl fmt::Debug for Filters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filters")
            .field("labels", &self.labels)
            .field("annotations", &self.annotations)
            .field("value", &self.value)
            .field("when", &self.when.as_ref().map(|_| ".."))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kreact_core::diffs::field_path;
    use serde_json::json;

    fn body() -> Body {
        Body::new(json!({
            "metadata": {"labels": {"app": "web"}, "annotations": {"owner": "team-a"}},
            "spec": {"size": 3}
        }))
    }

    #[test]
    fn empty_filters_match_everything() {
        assert!(Filters::default().matches(&body()));
        assert!(Filters::default().is_empty());
    }

    #[test]
    fn all_conditions_must_hold() {
        let mut f = Filters {
            labels: vec![("app".into(), MetaFilter::Equals("web".into()))],
            annotations: vec![("missing".into(), MetaFilter::Absent)],
            value: Some((field_path("spec.size"), ValueFilter::Equals(json!(3)))),
            when: None,
        };
        assert!(f.matches(&body()));
        f.labels.push(("tier".into(), MetaFilter::Present));
        assert!(!f.matches(&body()));
    }

    #[test]
    fn callbacks_see_the_values() {
        let f = Filters {
            annotations: vec![("owner".into(), MetaFilter::Callback(Arc::new(|v| v.map_or(false, |s| s.starts_with("team-")))))],
            value: Some((field_path("spec.size"), ValueFilter::Callback(Arc::new(|v| v.and_then(Value::as_u64) > Some(2))))),
            when: Some(Arc::new(|b: &Body| b.label("app").is_some())),
            ..Default::default()
        };
        assert!(f.matches(&body()));
    }
}
