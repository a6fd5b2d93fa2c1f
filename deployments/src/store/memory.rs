//! In-process document store. Every operation runs under one lock, which
//! gives the same single-document atomicity the Postgres backend provides.

use crate::store::filter::{lookup, values_equal};
use crate::store::{
    Client, Database, Document, Filter, FindOptions, IndexModel, ReturnDocument, SortOrder,
    StoreError, StoreResult, Update, UpdateResult, ensure_id, upsert_seed,
};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Collection {
    docs: Vec<Document>,
    indexes: Vec<IndexModel>,
}

type Namespaces = HashMap<String, HashMap<String, Collection>>;

#[derive(Debug, Default, Clone)]
pub struct MemoryClient {
    namespaces: Arc<Mutex<Namespaces>>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Client for MemoryClient {
    fn database(&self, name: &str) -> Arc<dyn Database> {
        Arc::new(MemoryDatabase {
            name: name.to_string(),
            namespaces: self.namespaces.clone(),
        })
    }

    async fn list_databases(&self) -> StoreResult<Vec<String>> {
        let namespaces = self.namespaces.lock().await;
        let mut names: Vec<String> = namespaces.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[derive(Debug)]
pub struct MemoryDatabase {
    name: String,
    namespaces: Arc<Mutex<Namespaces>>,
}

impl MemoryDatabase {
    async fn with_collection<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut Collection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut namespaces = self.namespaces.lock().await;
        let coll = namespaces
            .entry(self.name.clone())
            .or_default()
            .entry(collection.to_string())
            .or_default();
        f(coll)
    }

    async fn read_collection<T>(
        &self,
        collection: &str,
        f: impl FnOnce(Option<&Collection>) -> T,
    ) -> T {
        let namespaces = self.namespaces.lock().await;
        f(namespaces
            .get(&self.name)
            .and_then(|colls| colls.get(collection)))
    }
}

fn unique_key(index: &IndexModel, doc: &Document) -> Vec<Value> {
    index
        .keys
        .iter()
        .map(|(path, _)| lookup(doc, path).cloned().unwrap_or(Value::Null))
        .collect()
}

fn same_key(left: &[Value], right: &[Value]) -> bool {
    left.iter().zip(right).all(|(l, r)| values_equal(l, r))
}

impl Collection {
    /// Rejects `candidate` when it would share a unique key with any document
    /// other than the one at `replacing`.
    fn check_unique(
        &self,
        collection: &str,
        candidate: &Document,
        replacing: Option<usize>,
    ) -> StoreResult<()> {
        let candidate_id = candidate.get("_id");
        for (pos, existing) in self.docs.iter().enumerate() {
            if Some(pos) == replacing {
                continue;
            }
            if candidate_id.is_some() && existing.get("_id") == candidate_id {
                return Err(StoreError::DuplicateKey {
                    collection: collection.to_string(),
                    index: "_id_".to_string(),
                });
            }
        }
        for index in self.indexes.iter().filter(|index| index.unique) {
            if !index.covers(candidate) {
                continue;
            }
            let key = unique_key(index, candidate);
            let clash = self.docs.iter().enumerate().any(|(pos, existing)| {
                Some(pos) != replacing
                    && index.covers(existing)
                    && same_key(&unique_key(index, existing), &key)
            });
            if clash {
                return Err(StoreError::DuplicateKey {
                    collection: collection.to_string(),
                    index: index.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn insert(&mut self, collection: &str, mut doc: Document) -> StoreResult<()> {
        ensure_id(&mut doc);
        self.check_unique(collection, &doc, None)?;
        self.docs.push(doc);
        Ok(())
    }

    /// Applies `update` to the document at `pos`; returns (before, after).
    fn update_at(
        &mut self,
        collection: &str,
        pos: usize,
        update: &Update,
    ) -> StoreResult<(Document, Document)> {
        let before = self.docs[pos].clone();
        let mut after = before.clone();
        update.apply(&mut after);
        if after != before {
            self.check_unique(collection, &after, Some(pos))?;
            self.docs[pos] = after.clone();
        }
        Ok((before, after))
    }

    fn upsert(&mut self, collection: &str, filter: &Filter, update: &Update) -> StoreResult<()> {
        let mut doc = upsert_seed(filter);
        update.apply(&mut doc);
        self.insert(collection, doc)
    }
}

fn sort_docs(docs: &mut [Document], path: &str, order: SortOrder) {
    docs.sort_by(|l, r| {
        let ordering = compare_values(lookup(l, path), lookup(r, path));
        match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
}

fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (Some(Value::Number(l)), Some(Value::Number(r))) => l
            .as_f64()
            .partial_cmp(&r.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(l)), Some(Value::String(r))) => l.cmp(r),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> StoreResult<()> {
        self.with_collection(collection, |coll| {
            for doc in docs {
                coll.insert(collection, doc)?;
            }
            Ok(())
        })
        .await
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>> {
        let mut found: Vec<Document> = self
            .read_collection(collection, |coll| {
                coll.map(|coll| {
                    coll.docs
                        .iter()
                        .filter(|doc| filter.matches(doc))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
            })
            .await;
        if let Some((path, order)) = &options.sort {
            sort_docs(&mut found, path, *order);
        }
        let skipped = found.into_iter().skip(options.skip as usize);
        Ok(match options.limit {
            Some(limit) => skipped.take(limit as usize).collect(),
            None => skipped.collect(),
        })
    }

    async fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        Ok(self
            .read_collection(collection, |coll| {
                coll.map(|coll| coll.docs.iter().filter(|doc| filter.matches(doc)).count())
                    .unwrap_or(0)
            })
            .await as u64)
    }

    async fn count_by(
        &self,
        collection: &str,
        filter: &Filter,
        field: &str,
    ) -> StoreResult<Vec<(Value, u64)>> {
        Ok(self
            .read_collection(collection, |coll| {
                let mut groups: Vec<(Value, u64)> = Vec::new();
                for doc in coll.iter().flat_map(|coll| coll.docs.iter()) {
                    if !filter.matches(doc) {
                        continue;
                    }
                    let key = lookup(doc, field).cloned().unwrap_or(Value::Null);
                    match groups.iter_mut().find(|(k, _)| values_equal(k, &key)) {
                        Some((_, count)) => *count += 1,
                        None => groups.push((key, 1)),
                    }
                }
                groups
            })
            .await)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<UpdateResult> {
        self.with_collection(collection, |coll| {
            match coll.docs.iter().position(|doc| filter.matches(doc)) {
                Some(pos) => {
                    let (before, after) = coll.update_at(collection, pos, update)?;
                    Ok(UpdateResult {
                        matched: 1,
                        modified: u64::from(before != after),
                        upserted: false,
                    })
                }
                None if upsert => {
                    coll.upsert(collection, filter, update)?;
                    Ok(UpdateResult {
                        upserted: true,
                        ..Default::default()
                    })
                }
                None => Ok(UpdateResult::default()),
            }
        })
        .await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> StoreResult<UpdateResult> {
        self.with_collection(collection, |coll| {
            let positions: Vec<usize> = coll
                .docs
                .iter()
                .enumerate()
                .filter(|(_, doc)| filter.matches(doc))
                .map(|(pos, _)| pos)
                .collect();
            let mut result = UpdateResult::default();
            for pos in positions {
                let (before, after) = coll.update_at(collection, pos, update)?;
                result.matched += 1;
                result.modified += u64::from(before != after);
            }
            Ok(result)
        })
        .await
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        returning: ReturnDocument,
    ) -> StoreResult<Option<Document>> {
        self.with_collection(collection, |coll| {
            let Some(pos) = coll.docs.iter().position(|doc| filter.matches(doc)) else {
                return Ok(None);
            };
            let (before, after) = coll.update_at(collection, pos, update)?;
            Ok(Some(match returning {
                ReturnDocument::Before => before,
                ReturnDocument::After => after,
            }))
        })
        .await
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        mut doc: Document,
        upsert: bool,
    ) -> StoreResult<UpdateResult> {
        self.with_collection(collection, |coll| {
            match coll.docs.iter().position(|existing| filter.matches(existing)) {
                Some(pos) => {
                    if let Some(id) = coll.docs[pos].get("_id") {
                        doc.insert("_id".to_string(), id.clone());
                    }
                    let modified = coll.docs[pos] != doc;
                    coll.check_unique(collection, &doc, Some(pos))?;
                    coll.docs[pos] = doc;
                    Ok(UpdateResult {
                        matched: 1,
                        modified: u64::from(modified),
                        upserted: false,
                    })
                }
                None if upsert => {
                    let mut seeded = upsert_seed(filter);
                    seeded.extend(doc);
                    coll.insert(collection, seeded)?;
                    Ok(UpdateResult {
                        upserted: true,
                        ..Default::default()
                    })
                }
                None => Ok(UpdateResult::default()),
            }
        })
        .await
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        self.with_collection(collection, |coll| {
            match coll.docs.iter().position(|doc| filter.matches(doc)) {
                Some(pos) => {
                    coll.docs.remove(pos);
                    Ok(1)
                }
                None => Ok(0),
            }
        })
        .await
    }

    async fn create_index(&self, collection: &str, index: &IndexModel) -> StoreResult<()> {
        self.with_collection(collection, |coll| {
            if let Some(existing) = coll.indexes.iter().find(|idx| idx.name == index.name) {
                if existing == index {
                    return Ok(());
                }
                return Err(StoreError::IndexConflict {
                    collection: collection.to_string(),
                    name: index.name.clone(),
                });
            }
            if index.unique {
                let covered: Vec<Vec<Value>> = coll
                    .docs
                    .iter()
                    .filter(|doc| index.covers(doc))
                    .map(|doc| unique_key(index, doc))
                    .collect();
                for (i, key) in covered.iter().enumerate() {
                    if covered[i + 1..].iter().any(|other| same_key(key, other)) {
                        return Err(StoreError::DuplicateKey {
                            collection: collection.to_string(),
                            index: index.name.clone(),
                        });
                    }
                }
            }
            coll.indexes.push(index.clone());
            Ok(())
        })
        .await
    }

    async fn drop_index(&self, collection: &str, name: &str) -> StoreResult<bool> {
        let mut namespaces = self.namespaces.lock().await;
        let Some(coll) = namespaces
            .get_mut(&self.name)
            .and_then(|colls| colls.get_mut(collection))
        else {
            return Ok(false);
        };
        let before = coll.indexes.len();
        coll.indexes.retain(|index| index.name != name);
        Ok(coll.indexes.len() != before)
    }

    async fn list_indexes(&self, collection: &str) -> StoreResult<Vec<IndexModel>> {
        Ok(self
            .read_collection(collection, |coll| {
                coll.map(|coll| coll.indexes.clone()).unwrap_or_default()
            })
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IndexOrder;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn find_one_and_update_returns_previous_document() {
        let client = MemoryClient::new();
        let db = client.database("test");
        db.insert_many("devices", vec![doc(json!({"_id": "1", "status": "pending"}))])
            .await
            .unwrap();

        let before = db
            .find_one_and_update(
                "devices",
                &Filter::eq("_id", "1"),
                &Update::new().set("status", "downloading"),
                ReturnDocument::Before,
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(before["status"], json!("pending"));
        let now = db
            .find_one("devices", &Filter::eq("_id", "1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(now["status"], json!("downloading"));
    }

    #[tokio::test]
    async fn identical_index_is_accepted_and_conflicting_one_rejected() {
        let client = MemoryClient::new();
        let db = client.database("test");
        let index = IndexModel::new("by_name").key("name", IndexOrder::Asc);

        db.create_index("releases", &index).await.unwrap();
        db.create_index("releases", &index).await.unwrap();

        let err = db
            .create_index("releases", &index.clone().unique())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IndexConflict { .. }));
        assert_eq!(db.list_indexes("releases").await.unwrap(), vec![index]);
    }

    #[tokio::test]
    async fn unique_index_rejects_upsert_of_existing_key() {
        let client = MemoryClient::new();
        let db = client.database("test");
        db.create_index(
            "releases",
            &IndexModel::new("name").key("name", IndexOrder::Asc).unique(),
        )
        .await
        .unwrap();
        db.insert_many("releases", vec![doc(json!({"name": "r1", "artifacts": [{"_id": "a"}]}))])
            .await
            .unwrap();

        let filter = Filter::and(vec![
            Filter::eq("name", "r1"),
            Filter::negate(Filter::elem_match("artifacts", "_id", "a")),
        ]);
        let err = db
            .update_one("releases", &filter, &Update::new().push("artifacts", json!({"_id": "a"})), true)
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert_eq!(db.count("releases", &Filter::All).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn count_by_groups_values() {
        let client = MemoryClient::new();
        let db = client.database("test");
        db.insert_many(
            "devices",
            vec![
                doc(json!({"d": "x", "status": "pending"})),
                doc(json!({"d": "x", "status": "success"})),
                doc(json!({"d": "x", "status": "pending"})),
                doc(json!({"d": "y", "status": "pending"})),
            ],
        )
        .await
        .unwrap();

        let mut groups = db
            .count_by("devices", &Filter::eq("d", "x"), "status")
            .await
            .unwrap();
        groups.sort_by(|l, r| l.0.as_str().cmp(&r.0.as_str()));

        assert_eq!(groups, vec![(json!("pending"), 2), (json!("success"), 1)]);
        assert_eq!(client.list_databases().await.unwrap(), vec!["test".to_string()]);
    }

    #[tokio::test]
    async fn update_many_reports_modified_documents_only() {
        let client = MemoryClient::new();
        let db = client.database("test");
        db.insert_many(
            "deployments",
            vec![doc(json!({"active": true})), doc(json!({"active": false}))],
        )
        .await
        .unwrap();

        let result = db
            .update_many("deployments", &Filter::All, &Update::new().set("active", true))
            .await
            .unwrap();

        assert_eq!(result.matched, 2);
        assert_eq!(result.modified, 1);
    }
}
