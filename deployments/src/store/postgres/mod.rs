//! PostgreSQL backend. Each logical database is a schema and each collection
//! a table of JSONB documents keyed by their `_id`.

pub mod sql;

use crate::config::Config;
use crate::store::{
    Client, Database, Document, Filter, FindOptions, IndexModel, ReturnDocument, StoreError,
    StoreResult, Update, UpdateResult, ensure_id, upsert_seed,
};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use sql::{Params, quote_ident, render_filter, render_update};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const INDEX_CATALOG: &str = "_indexes";

#[derive(Debug, Clone)]
pub struct PgClient {
    pool: PgPool,
    ensured: Arc<Mutex<HashSet<String>>>,
}

impl PgClient {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            ensured: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.database_url)
            .await
            .context("failed to connect to postgres")?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl Client for PgClient {
    fn database(&self, name: &str) -> Arc<dyn Database> {
        Arc::new(PgDatabase {
            schema: name.to_string(),
            pool: self.pool.clone(),
            ensured: self.ensured.clone(),
        })
    }

    async fn list_databases(&self) -> StoreResult<Vec<String>> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT nspname::text FROM pg_namespace ORDER BY nspname",
        )
        .fetch_all(&self.pool)
        .await?)
    }
}

#[derive(Debug)]
pub struct PgDatabase {
    schema: String,
    pool: PgPool,
    ensured: Arc<Mutex<HashSet<String>>>,
}

fn is_missing_relation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("42P01") | Some("3F000"))
        }
        _ => false,
    }
}

fn write_error(err: sqlx::Error, collection: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            StoreError::DuplicateKey {
                collection: collection.to_string(),
                index: db.constraint().unwrap_or("_id_").to_string(),
            }
        }
        _ => StoreError::Database(err),
    }
}

fn into_document(value: Value) -> StoreResult<Document> {
    Ok(serde_json::from_value(value)?)
}

impl PgDatabase {
    fn table(&self, collection: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(collection))
    }

    fn catalog(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(INDEX_CATALOG))
    }

    /// Creates the schema, the collection table and the index catalog on
    /// first write.
    async fn ensure_collection(&self, collection: &str) -> StoreResult<()> {
        let key = format!("{}.{collection}", self.schema);
        if self.ensured.lock().await.contains(&key) {
            return Ok(());
        }

        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.schema)),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (collection TEXT NOT NULL, name TEXT NOT NULL, model JSONB NOT NULL, PRIMARY KEY (collection, name))",
                self.catalog()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, doc JSONB NOT NULL)",
                self.table(collection)
            ),
        ];
        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        debug!(schema = %self.schema, collection, "collection ready");
        self.ensured.lock().await.insert(key);
        Ok(())
    }

    async fn insert_doc(&self, collection: &str, mut doc: Document) -> StoreResult<()> {
        let id = ensure_id(&mut doc);
        sqlx::query(&format!(
            "INSERT INTO {} (id, doc) VALUES ($1, $2)",
            self.table(collection)
        ))
        .bind(id)
        .bind(Value::Object(doc))
        .execute(&self.pool)
        .await
        .map_err(|err| write_error(err, collection))?;
        Ok(())
    }

    /// Applies `update` to the first (or every) matching row in one statement
    /// and returns each row as (before, after).
    async fn update_rows(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        single: bool,
    ) -> StoreResult<Vec<(Document, Document)>> {
        let table = self.table(collection);
        let mut params = Params::new();
        let statement = format!(
            "WITH target AS (SELECT c.id, c.doc FROM {table} AS c WHERE {}{} FOR UPDATE) \
             UPDATE {table} AS u SET doc = {} FROM target WHERE u.id = target.id \
             RETURNING target.doc, u.doc",
            render_filter(filter, "c.doc", &mut params),
            if single { " LIMIT 1" } else { "" },
            render_update(update, "target.doc", &mut params),
        );

        let mut query = sqlx::query_as::<_, (Value, Value)>(&statement);
        for value in params.into_values() {
            query = query.bind(value);
        }
        let rows = match query.fetch_all(&self.pool).await {
            Ok(rows) => rows,
            Err(err) if is_missing_relation(&err) => Vec::new(),
            Err(err) => return Err(write_error(err, collection)),
        };

        rows.into_iter()
            .map(|(before, after)| Ok((into_document(before)?, into_document(after)?)))
            .collect()
    }
}

fn write_result(rows: &[(Document, Document)]) -> UpdateResult {
    UpdateResult {
        matched: rows.len() as u64,
        modified: rows.iter().filter(|(before, after)| before != after).count() as u64,
        upserted: false,
    }
}

#[async_trait]
impl Database for PgDatabase {
    fn name(&self) -> &str {
        &self.schema
    }

    #[tracing::instrument(skip(self, docs), fields(db = %self.schema, count = docs.len()))]
    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> StoreResult<()> {
        self.ensure_collection(collection).await?;
        let mut tx = self.pool.begin().await?;
        let statement = format!(
            "INSERT INTO {} (id, doc) VALUES ($1, $2)",
            self.table(collection)
        );
        for mut doc in docs {
            let id = ensure_id(&mut doc);
            sqlx::query(&statement)
                .bind(id)
                .bind(Value::Object(doc))
                .execute(&mut *tx)
                .await
                .map_err(|err| write_error(err, collection))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>> {
        let mut params = Params::new();
        let mut statement = format!(
            "SELECT c.doc FROM {} AS c WHERE {}",
            self.table(collection),
            render_filter(filter, "c.doc", &mut params)
        );
        if let Some((path, order)) = &options.sort {
            statement.push(' ');
            statement.push_str(&sql::render_sort(path, *order));
        }
        if options.skip > 0 {
            statement.push_str(&format!(" OFFSET {}", options.skip));
        }
        if let Some(limit) = options.limit {
            statement.push_str(&format!(" LIMIT {limit}"));
        }

        let mut query = sqlx::query_scalar::<_, Value>(&statement);
        for value in params.into_values() {
            query = query.bind(value);
        }
        match query.fetch_all(&self.pool).await {
            Ok(rows) => rows.into_iter().map(into_document).collect(),
            Err(err) if is_missing_relation(&err) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        let mut params = Params::new();
        let statement = format!(
            "SELECT COUNT(*) FROM {} AS c WHERE {}",
            self.table(collection),
            render_filter(filter, "c.doc", &mut params)
        );
        let mut query = sqlx::query_scalar::<_, i64>(&statement);
        for value in params.into_values() {
            query = query.bind(value);
        }
        match query.fetch_one(&self.pool).await {
            Ok(count) => Ok(count as u64),
            Err(err) if is_missing_relation(&err) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    async fn count_by(
        &self,
        collection: &str,
        filter: &Filter,
        field: &str,
    ) -> StoreResult<Vec<(Value, u64)>> {
        let key = sql::field("c.doc", field);
        let mut params = Params::new();
        let statement = format!(
            "SELECT {key}, COUNT(*) FROM {} AS c WHERE {} GROUP BY 1",
            self.table(collection),
            render_filter(filter, "c.doc", &mut params)
        );
        let mut query = sqlx::query_as::<_, (Option<Value>, i64)>(&statement);
        for value in params.into_values() {
            query = query.bind(value);
        }
        match query.fetch_all(&self.pool).await {
            Ok(groups) => Ok(groups
                .into_iter()
                .map(|(key, count)| (key.unwrap_or(Value::Null), count as u64))
                .collect()),
            Err(err) if is_missing_relation(&err) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    #[tracing::instrument(skip(self, filter, update), fields(db = %self.schema))]
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<UpdateResult> {
        let rows = self.update_rows(collection, filter, update, true).await?;
        if rows.is_empty() && upsert {
            self.ensure_collection(collection).await?;
            let mut doc = upsert_seed(filter);
            update.apply(&mut doc);
            self.insert_doc(collection, doc).await?;
            return Ok(UpdateResult {
                upserted: true,
                ..Default::default()
            });
        }
        Ok(write_result(&rows))
    }

    #[tracing::instrument(skip(self, filter, update), fields(db = %self.schema))]
    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> StoreResult<UpdateResult> {
        let rows = self.update_rows(collection, filter, update, false).await?;
        Ok(write_result(&rows))
    }

    #[tracing::instrument(skip(self, filter, update), fields(db = %self.schema))]
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        returning: ReturnDocument,
    ) -> StoreResult<Option<Document>> {
        let rows = self.update_rows(collection, filter, update, true).await?;
        Ok(rows.into_iter().next().map(|(before, after)| match returning {
            ReturnDocument::Before => before,
            ReturnDocument::After => after,
        }))
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        doc: Document,
        upsert: bool,
    ) -> StoreResult<UpdateResult> {
        let table = self.table(collection);
        let mut params = Params::new();
        let predicate = render_filter(filter, "c.doc", &mut params);
        let replacement = params.bind(Value::Object(doc.clone()));
        let statement = format!(
            "WITH target AS (SELECT c.id, c.doc FROM {table} AS c WHERE {predicate} LIMIT 1 FOR UPDATE) \
             UPDATE {table} AS u SET doc = {replacement} || jsonb_build_object('_id', target.doc -> '_id') \
             FROM target WHERE u.id = target.id RETURNING target.doc, u.doc",
        );
        let mut query = sqlx::query_as::<_, (Value, Value)>(&statement);
        for value in params.into_values() {
            query = query.bind(value);
        }
        let replaced = match query.fetch_optional(&self.pool).await {
            Ok(row) => row,
            Err(err) if is_missing_relation(&err) => None,
            Err(err) => return Err(write_error(err, collection)),
        };

        match replaced {
            Some((before, after)) => Ok(UpdateResult {
                matched: 1,
                modified: u64::from(before != after),
                upserted: false,
            }),
            None if upsert => {
                self.ensure_collection(collection).await?;
                let mut seeded = upsert_seed(filter);
                seeded.extend(doc);
                self.insert_doc(collection, seeded).await?;
                Ok(UpdateResult {
                    upserted: true,
                    ..Default::default()
                })
            }
            None => Ok(UpdateResult::default()),
        }
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        let table = self.table(collection);
        let mut params = Params::new();
        let statement = format!(
            "DELETE FROM {table} WHERE id IN (SELECT c.id FROM {table} AS c WHERE {} LIMIT 1)",
            render_filter(filter, "c.doc", &mut params)
        );
        let mut query = sqlx::query(&statement);
        for value in params.into_values() {
            query = query.bind(value);
        }
        match query.execute(&self.pool).await {
            Ok(done) => Ok(done.rows_affected()),
            Err(err) if is_missing_relation(&err) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    #[tracing::instrument(skip(self, index), fields(db = %self.schema, index = %index.name))]
    async fn create_index(&self, collection: &str, index: &IndexModel) -> StoreResult<()> {
        self.ensure_collection(collection).await?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{}.{collection}.{}", self.schema, index.name))
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query_scalar::<_, Value>(&format!(
            "SELECT model FROM {} WHERE collection = $1 AND name = $2",
            self.catalog()
        ))
        .bind(collection)
        .bind(&index.name)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(model) = existing {
            let model: IndexModel = serde_json::from_value(model)?;
            if &model == index {
                return Ok(());
            }
            return Err(StoreError::IndexConflict {
                collection: collection.to_string(),
                name: index.name.clone(),
            });
        }

        sqlx::query(&sql::render_create_index(&self.schema, collection, index))
            .execute(&mut *tx)
            .await
            .map_err(|err| write_error(err, collection))?;
        sqlx::query(&format!(
            "INSERT INTO {} (collection, name, model) VALUES ($1, $2, $3)",
            self.catalog()
        ))
        .bind(collection)
        .bind(&index.name)
        .bind(serde_json::to_value(index)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(collection, index = %index.name, "index created");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db = %self.schema))]
    async fn drop_index(&self, collection: &str, name: &str) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let removed = match sqlx::query(&format!(
            "DELETE FROM {} WHERE collection = $1 AND name = $2",
            self.catalog()
        ))
        .bind(collection)
        .bind(name)
        .execute(&mut *tx)
        .await
        {
            Ok(done) => done.rows_affected() > 0,
            Err(err) if is_missing_relation(&err) => false,
            Err(err) => return Err(err.into()),
        };
        if !removed {
            return Ok(false);
        }

        sqlx::query(&format!(
            "DROP INDEX IF EXISTS {}.{}",
            quote_ident(&self.schema),
            quote_ident(&sql::index_name(collection, name))
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_indexes(&self, collection: &str) -> StoreResult<Vec<IndexModel>> {
        let models = match sqlx::query_scalar::<_, Value>(&format!(
            "SELECT model FROM {} WHERE collection = $1 ORDER BY name",
            self.catalog()
        ))
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        {
            Ok(models) => models,
            Err(err) if is_missing_relation(&err) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        models
            .into_iter()
            .map(|model| Ok(serde_json::from_value(model)?))
            .collect()
    }
}

#[cfg(test)]
mod tests;
