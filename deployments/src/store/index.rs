use crate::store::Filter;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOrder {
    Asc,
    Desc,
    /// Case-folded key used by substring search.
    Text,
}

/// Named index definition. Two definitions with the same name are
/// compatible only when every attribute is identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexModel {
    pub name: String,
    pub keys: Vec<(String, IndexOrder)>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
    #[serde(default)]
    pub partial: Option<Filter>,
}

impl IndexModel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            keys: Vec::new(),
            unique: false,
            sparse: false,
            partial: None,
        }
    }

    pub fn key(mut self, path: &str, order: IndexOrder) -> Self {
        self.keys.push((path.to_string(), order));
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    pub fn partial(mut self, filter: Filter) -> Self {
        self.partial = Some(filter);
        self
    }

    /// Documents covered by the index: everything matching the partial
    /// filter, and for sparse indexes only those carrying a key field.
    pub fn covers(&self, doc: &crate::store::Document) -> bool {
        if let Some(partial) = &self.partial {
            if !partial.matches(doc) {
                return false;
            }
        }
        !self.sparse
            || self
                .keys
                .iter()
                .any(|(path, _)| crate::store::filter::lookup(doc, path).is_some())
    }
}
