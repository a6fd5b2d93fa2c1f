use crate::store::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Boolean predicate over a JSON document.
///
/// Paths are dot separated (`stats.pending`). A missing field behaves like
/// `null` for equality and never satisfies an ordering comparison, so the
/// in-memory evaluation here and the SQL rendering in the Postgres backend
/// agree on every document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    All,
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    In(String, Vec<Value>),
    Exists(String, bool),
    NotNull(String),
    /// Array at `array` holds an object whose `field` equals `value`.
    ElemMatch {
        array: String,
        field: String,
        value: Value,
    },
    /// Case-insensitive substring match on a string field.
    Contains(String, String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(path: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(path.to_string(), value.into())
    }

    pub fn ne(path: &str, value: impl Into<Value>) -> Self {
        Filter::Ne(path.to_string(), value.into())
    }

    pub fn gt(path: &str, value: impl Into<Value>) -> Self {
        Filter::Gt(path.to_string(), value.into())
    }

    pub fn gte(path: &str, value: impl Into<Value>) -> Self {
        Filter::Gte(path.to_string(), value.into())
    }

    pub fn lt(path: &str, value: impl Into<Value>) -> Self {
        Filter::Lt(path.to_string(), value.into())
    }

    pub fn lte(path: &str, value: impl Into<Value>) -> Self {
        Filter::Lte(path.to_string(), value.into())
    }

    pub fn is_in<V: Into<Value>>(path: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In(
            path.to_string(),
            values.into_iter().map(Into::into).collect(),
        )
    }

    pub fn exists(path: &str, exists: bool) -> Self {
        Filter::Exists(path.to_string(), exists)
    }

    pub fn not_null(path: &str) -> Self {
        Filter::NotNull(path.to_string())
    }

    pub fn elem_match(array: &str, field: &str, value: impl Into<Value>) -> Self {
        Filter::ElemMatch {
            array: array.to_string(),
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn contains(path: &str, text: &str) -> Self {
        Filter::Contains(path.to_string(), text.to_string())
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    pub fn negate(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(path, value) => values_equal(lookup(doc, path).unwrap_or(&Value::Null), value),
            Filter::Ne(path, value) => {
                !values_equal(lookup(doc, path).unwrap_or(&Value::Null), value)
            }
            Filter::Gt(path, value) => compare(doc, path, value) == Some(Ordering::Greater),
            Filter::Gte(path, value) => matches!(
                compare(doc, path, value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Lt(path, value) => compare(doc, path, value) == Some(Ordering::Less),
            Filter::Lte(path, value) => matches!(
                compare(doc, path, value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Filter::In(path, values) => {
                let found = lookup(doc, path).unwrap_or(&Value::Null);
                values.iter().any(|value| values_equal(found, value))
            }
            Filter::Exists(path, exists) => lookup(doc, path).is_some() == *exists,
            Filter::NotNull(path) => !matches!(lookup(doc, path), None | Some(Value::Null)),
            Filter::ElemMatch {
                array,
                field,
                value,
            } => match lookup(doc, array) {
                Some(Value::Array(items)) => items.iter().any(|item| {
                    item.as_object()
                        .and_then(|item| lookup(item, field))
                        .is_some_and(|found| values_equal(found, value))
                }),
                _ => false,
            },
            Filter::Contains(path, text) => match lookup(doc, path) {
                Some(Value::String(found)) => {
                    found.to_lowercase().contains(&text.to_lowercase())
                }
                _ => false,
            },
            Filter::And(filters) => filters.iter().all(|filter| filter.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|filter| filter.matches(doc)),
            Filter::Not(filter) => !filter.matches(doc),
        }
    }

    /// Fields pinned by top-level equality terms; an upsert seeds the new
    /// document with them.
    pub fn equality_fields(&self) -> Vec<(&str, &Value)> {
        match self {
            Filter::Eq(path, value) => vec![(path.as_str(), value)],
            Filter::And(filters) => filters
                .iter()
                .flat_map(|filter| filter.equality_fields())
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Resolves a dotted path inside nested objects.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

pub(crate) fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_i64(), r.as_i64()) {
            (Some(l), Some(r)) => l == r,
            _ => l.as_f64() == r.as_f64(),
        },
        (Value::Array(l), Value::Array(r)) => {
            l.len() == r.len() && l.iter().zip(r).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(l), Value::Object(r)) => {
            l.len() == r.len()
                && l.iter()
                    .all(|(key, l)| r.get(key).is_some_and(|r| values_equal(l, r)))
        }
        _ => left == right,
    }
}

// Ordering only exists between values of the same JSON type.
fn compare(doc: &Document, path: &str, value: &Value) -> Option<Ordering> {
    match (lookup(doc, path)?, value) {
        (Value::Number(l), Value::Number(r)) => match (l.as_i64(), r.as_i64()) {
            (Some(l), Some(r)) => Some(l.cmp(&r)),
            _ => l.as_f64()?.partial_cmp(&r.as_f64()?),
        },
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}
