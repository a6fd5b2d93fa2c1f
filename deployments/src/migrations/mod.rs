//! Versioned schema migrations, applied per logical database.
//!
//! Every database records each version it was migrated to in
//! `migration_info`; the highest record is its current version. Steps newer
//! than that and not newer than the target are applied in ascending order,
//! each recorded as soon as it succeeds. Steps tolerate being re-run.

use crate::db::{COLLECTION_MIGRATIONS, DataStore, KEY_ID, timestamp};
use crate::error::{Error, Result, StoreContext};
use crate::store::{Database, Filter, FindOptions, IndexModel, StoreError, Update};
use crate::tenant::{TenantId, is_tenant_db, tenant_from_db};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

mod steps;
mod version;

pub use steps::all;
pub use version::Version;

/// Which kind of logical database a step runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Default,
    Tenant,
}

#[async_trait]
pub trait Migration: Send + Sync {
    fn version(&self) -> Version;

    async fn up(&self, db: &dyn Database, scope: Scope) -> Result<()>;
}

pub(crate) fn store_error(database: &str, operation: &'static str) -> impl FnOnce(StoreError) -> Error {
    let database = database.to_string();
    move |source| match source {
        StoreError::IndexConflict { .. } => Error::SchemaConflict { database, source },
        source => Error::StoreUnavailable { operation, source },
    }
}

pub(crate) async fn ensure_index(db: &dyn Database, collection: &str, index: IndexModel) -> Result<()> {
    db.create_index(collection, &index)
        .await
        .map_err(store_error(db.name(), "create index"))
}

/// Dropping an index that does not exist is not an error.
pub(crate) async fn drop_index(db: &dyn Database, collection: &str, name: &str) -> Result<()> {
    let dropped = db.drop_index(collection, name).await.during("drop index")?;
    if dropped {
        debug!(db = db.name(), collection, name, "dropped index");
    }
    Ok(())
}

pub struct Migrator {
    steps: Vec<Box<dyn Migration>>,
    target: Version,
    automigrate: bool,
}

impl Migrator {
    pub fn new(mut steps: Vec<Box<dyn Migration>>, target: Version, automigrate: bool) -> Self {
        steps.sort_by_key(|step| step.version());
        Self {
            steps,
            target,
            automigrate,
        }
    }

    pub fn target(&self) -> Version {
        self.target
    }

    pub fn versions(&self) -> Vec<Version> {
        self.steps.iter().map(|step| step.version()).collect()
    }

    pub async fn current_version(db: &dyn Database) -> Result<Version> {
        let records = db
            .find(COLLECTION_MIGRATIONS, &Filter::All, &FindOptions::default())
            .await
            .during("load schema version")?;
        let mut current = Version::default();
        for record in records {
            match record
                .get("version")
                .cloned()
                .map(serde_json::from_value::<Version>)
            {
                Some(Ok(version)) => current = current.max(version),
                _ => warn!(db = db.name(), record = ?record.get(KEY_ID), "ignoring malformed migration record"),
            }
        }
        Ok(current)
    }

    async fn record(db: &dyn Database, version: Version) -> Result<()> {
        let update = Update::new()
            .set(
                "version",
                json!({"major": version.major, "minor": version.minor, "patch": version.patch}),
            )
            .set("timestamp", timestamp::value(&Utc::now()));
        db.update_one(
            COLLECTION_MIGRATIONS,
            &Filter::eq(KEY_ID, version.to_string()),
            &update,
            true,
        )
        .await
        .during("record schema version")?;
        Ok(())
    }

    /// Migrates `db` to the target version. Returns the versions applied.
    pub async fn apply(&self, db: &dyn Database, scope: Scope) -> Result<Vec<Version>> {
        self.apply_with(db, scope, self.automigrate).await
    }

    #[tracing::instrument(skip(self, db), fields(db = db.name(), target = %self.target))]
    async fn apply_with(&self, db: &dyn Database, scope: Scope, automigrate: bool) -> Result<Vec<Version>> {
        let current = Self::current_version(db).await?;
        if current > self.target {
            warn!(%current, "database is newer than this build; not migrating");
            return Ok(Vec::new());
        }
        if current == self.target {
            debug!(%current, "database is up to date");
            return Ok(Vec::new());
        }
        if !automigrate {
            return Err(Error::MigrationRequired {
                database: db.name().to_string(),
                current: current.to_string(),
                target: self.target.to_string(),
            });
        }

        let mut applied = Vec::new();
        for step in &self.steps {
            let version = step.version();
            if version <= current || version > self.target {
                continue;
            }
            info!(%version, "applying migration");
            step.up(db, scope).await.map_err(|err| match err {
                Error::SchemaConflict { .. } => err,
                err => Error::Migration {
                    version: version.to_string(),
                    database: db.name().to_string(),
                    source: Box::new(err),
                },
            })?;
            Self::record(db, version).await?;
            applied.push(version);
        }
        if applied.last() != Some(&self.target) {
            Self::record(db, self.target).await?;
        }
        info!(from = %current, applied = applied.len(), "migrated");
        Ok(applied)
    }

    /// Databases below the target version, with their current version.
    pub async fn outdated(&self, store: &DataStore) -> Result<Vec<(String, Version)>> {
        let mut outdated = Vec::new();
        for db in databases(store).await? {
            let current = Self::current_version(db.as_ref()).await?;
            if current < self.target {
                outdated.push((db.name().to_string(), current));
            }
        }
        Ok(outdated)
    }
}

/// Tenants with a database of their own.
pub async fn list_tenants(store: &DataStore) -> Result<Vec<TenantId>> {
    Ok(store
        .client()
        .list_databases()
        .await
        .during("list databases")?
        .iter()
        .filter_map(|name| tenant_from_db(store.db_name(), name))
        .collect())
}

async fn databases(store: &DataStore) -> Result<Vec<Arc<dyn Database>>> {
    let mut dbs = vec![store.default_database()];
    for name in store
        .client()
        .list_databases()
        .await
        .during("list databases")?
    {
        if is_tenant_db(store.db_name(), &name) {
            dbs.push(store.client().database(&name));
        }
    }
    Ok(dbs)
}

/// Migrates the default database and every tenant database, stopping at the
/// first failure.
pub async fn migrate_all(store: &DataStore, migrator: &Migrator) -> Result<()> {
    if migrator.automigrate {
        info!("automigrate is on, applying migrations");
    } else {
        info!("automigrate is off, checking schema versions");
    }
    for db in databases(store).await? {
        let scope = if db.name() == store.db_name() {
            Scope::Default
        } else {
            Scope::Tenant
        };
        migrator.apply(db.as_ref(), scope).await?;
    }
    Ok(())
}

/// Brings a newly provisioned tenant's database to the current version.
pub async fn provision_tenant(store: &DataStore, migrator: &Migrator, tenant: &TenantId) -> Result<()> {
    let db = store.database(Some(tenant));
    migrator.apply_with(db.as_ref(), Scope::Tenant, true).await?;
    info!(%tenant, "tenant provisioned");
    Ok(())
}
