use crate::store::filter::lookup;
use crate::store::{Document, Filter};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set(String, Value),
    Unset(String),
    Inc(String, i64),
    Push(String, Value),
    /// Sets `path` to the value of the first case whose filter matches the
    /// document as left by the preceding operations. No match leaves the
    /// field untouched.
    SetWhen {
        path: String,
        cases: Vec<(Filter, Value)>,
    },
}

/// Ordered list of field operations applied to one document as a single
/// write. Each operation observes the result of the ones before it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    ops: Vec<UpdateOp>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Set(path.to_string(), value.into()));
        self
    }

    pub fn unset(mut self, path: &str) -> Self {
        self.ops.push(UpdateOp::Unset(path.to_string()));
        self
    }

    pub fn inc(mut self, path: &str, by: i64) -> Self {
        self.ops.push(UpdateOp::Inc(path.to_string(), by));
        self
    }

    pub fn push(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Push(path.to_string(), value.into()));
        self
    }

    pub fn set_when(mut self, path: &str, cases: Vec<(Filter, Value)>) -> Self {
        self.ops.push(UpdateOp::SetWhen {
            path: path.to_string(),
            cases,
        });
        self
    }

    pub fn extend(mut self, other: Update) -> Self {
        self.ops.extend(other.ops);
        self
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn apply(&self, doc: &mut Document) {
        for op in &self.ops {
            match op {
                UpdateOp::Set(path, value) => set_path(doc, path, value.clone()),
                UpdateOp::Unset(path) => unset_path(doc, path),
                UpdateOp::Inc(path, by) => {
                    let current = lookup(doc, path).and_then(Value::as_i64).unwrap_or(0);
                    set_path(doc, path, Value::from(current + by));
                }
                UpdateOp::Push(path, value) => {
                    let mut items = match lookup(doc, path) {
                        Some(Value::Array(items)) => items.clone(),
                        _ => Vec::new(),
                    };
                    items.push(value.clone());
                    set_path(doc, path, Value::Array(items));
                }
                UpdateOp::SetWhen { path, cases } => {
                    let chosen = cases
                        .iter()
                        .find(|(filter, _)| filter.matches(doc))
                        .map(|(_, value)| value.clone());
                    if let Some(value) = chosen {
                        set_path(doc, path, value);
                    }
                }
            }
        }
    }
}

pub(crate) fn set_path(doc: &mut Document, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return;
    };
    let mut current = doc;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(map) = entry else {
            return;
        };
        current = map;
    }
    current.insert(last.to_string(), value);
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.rsplit_once('.') {
        None => {
            doc.remove(path);
        }
        Some((parent, last)) => {
            let mut current = doc;
            for segment in parent.split('.') {
                match current.get_mut(segment) {
                    Some(Value::Object(map)) => current = map,
                    _ => return,
                }
            }
            current.remove(last);
        }
    }
}
