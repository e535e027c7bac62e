use serde_json::{Map, Value};

/// Accumulated JSON merge-patch (RFC 7386) for one object and one cycle.
///
/// `null` values delete keys on the server; nested maps merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    body: Map<String, Value>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.body.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }

    /// Set a value at a path, creating intermediate maps as needed.
    pub fn set<S: AsRef<str>>(&mut self, path: &[S], value: Value) {
        let Some((last, parents)) = path.split_last() else { return };
        let mut cur = &mut self.body;
        for part in parents {
            let entry = cur
                .entry(part.as_ref().to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            cur = match entry {
                Value::Object(m) => m,
                _ => return,
            };
        }
        cur.insert(last.as_ref().to_string(), value);
    }

    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut cur = self.body.get(first.as_ref())?;
        for part in rest {
            cur = cur.get(part.as_ref())?;
        }
        Some(cur)
    }

    pub fn set_annotation(&mut self, key: &str, value: Option<String>) {
        self.set(&["metadata", "annotations", key], value.map(Value::String).unwrap_or(Value::Null));
    }

    pub fn set_finalizers(&mut self, finalizers: Vec<String>) {
        self.set(&["metadata", "finalizers"], Value::Array(finalizers.into_iter().map(Value::String).collect()));
    }

    /// Split off the `status` stanza for resources that serve it as a sub-resource.
    pub fn split_status(&self) -> (Option<Value>, Option<Value>) {
        let mut main = self.body.clone();
        let status = main.remove("status").map(|s| {
            let mut m = Map::new();
            m.insert("status".into(), s);
            Value::Object(m)
        });
        let main = if main.is_empty() { None } else { Some(Value::Object(main)) };
        (main, status)
    }

    /// Merge another patch into this one (the other wins on conflicts).
    pub fn merge(&mut self, other: &Patch) {
        let mut target = Value::Object(std::mem::take(&mut self.body));
        merge_into(&mut target, &other.as_value(), false);
        if let Value::Object(m) = target {
            self.body = m;
        }
    }

    /// Apply this patch locally to a body, as the server would.
    pub fn apply_to(&self, body: &Value) -> Value {
        let mut out = body.clone();
        merge_into(&mut out, &self.as_value(), true);
        out
    }
}

fn merge_into(target: &mut Value, patch: &Value, drop_nulls: bool) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target_map) = target else { return };
    for (k, v) in patch_map {
        if v.is_null() && drop_nulls {
            target_map.remove(k);
        } else if v.is_object() {
            let slot = target_map.entry(k.clone()).or_insert(Value::Null);
            merge_into(slot, v, drop_nulls);
        } else {
            target_map.insert(k.clone(), v.clone());
        }
    }
}
