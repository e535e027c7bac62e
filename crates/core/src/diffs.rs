use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

pub type FieldPath = SmallVec<[String; 4]>;

pub fn field_path(dotted: &str) -> FieldPath {
    dotted.split('.').filter(|s| !s.is_empty()).map(str::to_string).collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiffOperation {
    Add,
    Change,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffItem {
    pub operation: DiffOperation,
    pub field: FieldPath,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Diff(pub Vec<DiffItem>);

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiffItem> {
        self.0.iter()
    }

    /// Project the diff onto a sub-field.
    ///
    /// Items deeper than `path` are re-rooted; items shallower than `path`
    /// (e.g. the whole `spec` added) are re-diffed at the resolved sub-values.
    pub fn reduce(&self, path: &[String]) -> Diff {
        if path.is_empty() {
            return self.clone();
        }
        let mut out = Vec::new();
        for item in &self.0 {
            if item.field.len() >= path.len() && item.field[..path.len()] == *path {
                out.push(DiffItem {
                    operation: item.operation,
                    field: item.field[path.len()..].iter().cloned().collect(),
                    old: item.old.clone(),
                    new: item.new.clone(),
                });
            } else if item.field.len() < path.len() && path[..item.field.len()] == item.field[..] {
                let tail = &path[item.field.len()..];
                let old_tail = item.old.as_ref().and_then(|v| resolve(v, tail));
                let new_tail = item.new.as_ref().and_then(|v| resolve(v, tail));
                walk(old_tail, new_tail, &mut FieldPath::new(), &mut out);
            }
        }
        Diff(out)
    }
}

fn resolve<'a>(v: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut cur = v;
    for part in path {
        cur = cur.get(part.as_str())?;
    }
    Some(cur)
}

/// Compute the diff between two optional documents. JSON `null` counts as absent.
pub fn diff(old: Option<&Value>, new: Option<&Value>) -> Diff {
    let mut out = Vec::new();
    walk(old, new, &mut FieldPath::new(), &mut out);
    Diff(out)
}

fn walk(a: Option<&Value>, b: Option<&Value>, path: &mut FieldPath, out: &mut Vec<DiffItem>) {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => {}
        (None, Some(bv)) => out.push(DiffItem { operation: DiffOperation::Add, field: path.clone(), old: None, new: Some(bv.clone()) }),
        (Some(av), None) => out.push(DiffItem { operation: DiffOperation::Remove, field: path.clone(), old: Some(av.clone()), new: None }),
        (Some(av), Some(bv)) if av == bv => {}
        (Some(Value::Object(ao)), Some(Value::Object(bo))) => {
            for (k, bv) in bo.iter() {
                if !ao.contains_key(k) {
                    path.push(k.clone());
                    walk(None, Some(bv), path, out);
                    path.pop();
                }
            }
            for (k, av) in ao.iter() {
                if !bo.contains_key(k) {
                    path.push(k.clone());
                    walk(Some(av), None, path, out);
                    path.pop();
                }
            }
            for (k, av) in ao.iter() {
                if let Some(bv) = bo.get(k) {
                    path.push(k.clone());
                    walk(Some(av), Some(bv), path, out);
                    path.pop();
                }
            }
        }
        // Scalars, arrays or differing types change as a whole.
        (Some(av), Some(bv)) => out.push(DiffItem {
            operation: DiffOperation::Change,
            field: path.clone(),
            old: Some(av.clone()),
            new: Some(bv.clone()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_changes_adds_and_removes() {
        let a = json!({"spec": {"field": 1, "gone": true}, "keep": "x"});
        let b = json!({"spec": {"field": 2, "new": [1]}, "keep": "x"});
        let d = diff(Some(&a), Some(&b));
        assert_eq!(d.len(), 3);
        assert!(d.iter().any(|i| i.operation == DiffOperation::Add && i.field == field_path("spec.new")));
        assert!(d.iter().any(|i| i.operation == DiffOperation::Remove && i.field == field_path("spec.gone")));
        let change = d.iter().find(|i| i.operation == DiffOperation::Change).unwrap();
        assert_eq!(change.field, field_path("spec.field"));
        assert_eq!((change.old.clone(), change.new.clone()), (Some(json!(1)), Some(json!(2))));
    }

    #[test]
    fn identical_documents_have_empty_diff() {
        let a = json!({"spec": {"a": [1, 2]}});
        assert!(diff(Some(&a), Some(&a.clone())).is_empty());
        assert!(diff(None, Some(&Value::Null)).is_empty());
    }

    #[test]
    fn whole_document_creation_is_a_root_add() {
        let b = json!({"spec": {"a": 1}});
        let d = diff(None, Some(&b));
        assert_eq!(d.0, vec![DiffItem { operation: DiffOperation::Add, field: FieldPath::new(), old: None, new: Some(b) }]);
    }

    #[test]
    fn reduce_reroots_deep_items_and_resolves_shallow_ones() {
        let a = json!({"spec": {"x": {"y": 1}}});
        let b = json!({"spec": {"x": {"y": 2}}});
        let d = diff(Some(&a), Some(&b));
        let r = d.reduce(&field_path("spec.x"));
        assert_eq!(r.0[0].field, field_path("y"));

        let created = diff(None, Some(&b));
        let r = created.reduce(&field_path("spec.x.y"));
        assert_eq!(r.0, vec![DiffItem { operation: DiffOperation::Add, field: FieldPath::new(), old: None, new: Some(json!(2)) }]);
        assert!(created.reduce(&field_path("spec.absent")).is_empty());
    }
}
