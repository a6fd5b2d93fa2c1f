//! Document store interface the deployment core is written against.
//!
//! A [`Client`] hands out [`Database`] handles, one per logical database
//! (the default database or a tenant's). Every write below touches exactly
//! one document atomically, except the `*_many` operations which are atomic
//! per document only.

pub mod filter;
pub mod index;
pub mod memory;
pub mod postgres;
pub mod update;

pub use filter::Filter;
pub use index::{IndexModel, IndexOrder};
pub use update::Update;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

pub type Document = serde_json::Map<String, Value>;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error")]
    Database(#[from] sqlx::Error),
    #[error("index '{name}' on '{collection}' exists with a different definition")]
    IndexConflict { collection: String, name: String },
    #[error("duplicate key for unique index '{index}' on '{collection}'")]
    DuplicateKey { collection: String, index: String },
    #[error("malformed document")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<(String, SortOrder)>,
    pub skip: u64,
    pub limit: Option<u64>,
}

impl FindOptions {
    pub fn sorted(path: &str, order: SortOrder) -> Self {
        Self {
            sort: Some((path.to_string(), order)),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnDocument {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted: bool,
}

#[async_trait]
pub trait Database: Send + Sync + Debug {
    fn name(&self) -> &str;

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> StoreResult<()>;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>>;

    async fn find_one(&self, collection: &str, filter: &Filter) -> StoreResult<Option<Document>> {
        let options = FindOptions {
            limit: Some(1),
            ..Default::default()
        };
        Ok(self
            .find(collection, filter, &options)
            .await?
            .into_iter()
            .next())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64>;

    /// Number of matching documents grouped by the value at `field`.
    async fn count_by(
        &self,
        collection: &str,
        filter: &Filter,
        field: &str,
    ) -> StoreResult<Vec<(Value, u64)>>;

    /// Updates the first matching document. With `upsert`, a document seeded
    /// from the filter's equality fields is inserted when nothing matches.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<UpdateResult>;

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> StoreResult<UpdateResult>;

    /// Atomically updates the first matching document and returns it as it
    /// was before or after the write.
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        returning: ReturnDocument,
    ) -> StoreResult<Option<Document>>;

    async fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        doc: Document,
        upsert: bool,
    ) -> StoreResult<UpdateResult>;

    async fn delete_one(&self, collection: &str, filter: &Filter) -> StoreResult<u64>;

    /// Creating an index identical to an existing one is a no-op; reusing a
    /// name for a different definition fails with
    /// [`StoreError::IndexConflict`].
    async fn create_index(&self, collection: &str, index: &IndexModel) -> StoreResult<()>;

    /// Returns false when no index with that name exists.
    async fn drop_index(&self, collection: &str, name: &str) -> StoreResult<bool>;

    async fn list_indexes(&self, collection: &str) -> StoreResult<Vec<IndexModel>>;
}

#[async_trait]
pub trait Client: Send + Sync + Debug {
    fn database(&self, name: &str) -> Arc<dyn Database>;

    async fn list_databases(&self) -> StoreResult<Vec<String>>;
}

/// Seeds an upserted document from the filter's equality fields.
pub(crate) fn upsert_seed(filter: &Filter) -> Document {
    let mut doc = Document::new();
    for (path, value) in filter.equality_fields() {
        update::set_path(&mut doc, path, value.clone());
    }
    doc
}

/// Document id as stored in the `_id` field; generated when absent.
pub(crate) fn ensure_id(doc: &mut Document) -> String {
    match doc.get("_id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            doc.insert("_id".to_string(), Value::String(id.clone()));
            id
        }
    }
}
