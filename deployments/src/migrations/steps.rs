use crate::db::{
    COLLECTION_DEPLOYMENTS, COLLECTION_DEVICE_LOGS, COLLECTION_DEVICES,
    COLLECTION_DEVICES_LAST_STATUS, COLLECTION_IMAGES, COLLECTION_RELEASES, KEY_ACTIVE,
    KEY_ARTIFACT_NAME, KEY_CREATED, KEY_DEPLOYMENT_ID, KEY_DEVICE_ID, KEY_FINISHED, KEY_ID,
    KEY_IMAGE_NAME, KEY_NAME, KEY_RELEASE_ARTIFACTS, KEY_RELEASE_ARTIFACTS_COUNT,
    KEY_RELEASE_MODIFIED, KEY_RELEASE_NAME, KEY_STATUS, stats_key, timestamp,
};
use crate::deployment::DeploymentStatus;
use crate::error::{Result, StoreContext};
use crate::migrations::{Migration, Scope, Version, drop_index, ensure_index};
use crate::stats::{recount_in, replace_count_in};
use crate::status::DeviceDeploymentStatus;
use crate::store::filter::lookup;
use crate::store::{Database, Filter, FindOptions, IndexModel, IndexOrder, StoreError, Update};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

/// Every migration step, in version order.
pub fn all() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(TextSearchIndex),
        Box::new(CounterIndexes),
        Box::new(RecountStats),
        Box::new(DeviceDeploymentIndexes),
        Box::new(ActiveDeployments),
        Box::new(ActiveDeviceDeployments),
        Box::new(DeviceLogIndex),
        Box::new(LastStatusIndex),
        Box::new(ReleasesFromImages),
        Box::new(ReleaseArtifactCount),
    ]
}

async fn all_ids(db: &dyn Database, collection: &str) -> Result<Vec<Value>> {
    Ok(db
        .find(collection, &Filter::All, &FindOptions::default())
        .await
        .during("scan collection")?
        .into_iter()
        .filter_map(|doc| doc.get(KEY_ID).cloned())
        .collect())
}

pub struct TextSearchIndex;

#[async_trait]
impl Migration for TextSearchIndex {
    fn version(&self) -> Version {
        Version::new(1, 2, 1)
    }

    async fn up(&self, db: &dyn Database, _scope: Scope) -> Result<()> {
        ensure_index(
            db,
            COLLECTION_DEPLOYMENTS,
            IndexModel::new("deployment_name_text")
                .key(KEY_NAME, IndexOrder::Text)
                .key(KEY_ARTIFACT_NAME, IndexOrder::Text),
        )
        .await
    }
}

pub struct CounterIndexes;

const LEGACY_DEVICE_INDEXES: [&str; 3] = ["status", "deviceid_status", "deploymentid"];
const LEGACY_DEPLOYMENT_INDEXES: [&str; 4] = [
    "stats_finished",
    "stats_pending",
    "created",
    "finished",
];

#[async_trait]
impl Migration for CounterIndexes {
    fn version(&self) -> Version {
        Version::new(1, 2, 2)
    }

    async fn up(&self, db: &dyn Database, _scope: Scope) -> Result<()> {
        for name in LEGACY_DEVICE_INDEXES {
            drop_index(db, COLLECTION_DEVICES, name).await?;
        }
        for name in LEGACY_DEPLOYMENT_INDEXES {
            drop_index(db, COLLECTION_DEPLOYMENTS, name).await?;
        }

        ensure_index(
            db,
            COLLECTION_DEVICES,
            IndexModel::new("device_status_created")
                .key(KEY_DEVICE_ID, IndexOrder::Asc)
                .key(KEY_STATUS, IndexOrder::Asc)
                .key(KEY_CREATED, IndexOrder::Desc),
        )
        .await?;
        ensure_index(
            db,
            COLLECTION_DEVICES,
            IndexModel::new("device_deployment").key(KEY_DEPLOYMENT_ID, IndexOrder::Asc),
        )
        .await?;
        ensure_index(
            db,
            COLLECTION_DEPLOYMENTS,
            IndexModel::new("deployment_created").key(KEY_CREATED, IndexOrder::Desc),
        )
        .await?;
        ensure_index(
            db,
            COLLECTION_DEPLOYMENTS,
            IndexModel::new("deployment_finished").key(KEY_FINISHED, IndexOrder::Asc),
        )
        .await?;
        for status in [
            DeviceDeploymentStatus::Pending,
            DeviceDeploymentStatus::Installing,
            DeviceDeploymentStatus::Rebooting,
        ] {
            let key = stats_key(status.as_str());
            ensure_index(
                db,
                COLLECTION_DEPLOYMENTS,
                IndexModel::new(&format!("deployment_stats_{}", status.as_str()))
                    .key(&key, IndexOrder::Asc),
            )
            .await?;
        }
        Ok(())
    }
}

/// Rebuilds every deployment's counters from its device deployments and
/// rewrites the cached status to match.
pub struct RecountStats;

#[async_trait]
impl Migration for RecountStats {
    fn version(&self) -> Version {
        Version::new(1, 2, 4)
    }

    async fn up(&self, db: &dyn Database, _scope: Scope) -> Result<()> {
        let ids = all_ids(db, COLLECTION_DEPLOYMENTS).await?;
        for id in &ids {
            let Some(id) = id.as_str() else { continue };
            let stats = recount_in(db, id).await?;
            replace_count_in(db, id, &stats).await?;
            debug!(deployment_id = id, total = stats.total(), "recounted deployment");
        }
        info!(db = db.name(), deployments = ids.len(), "deployment counters recounted");

        ensure_index(
            db,
            COLLECTION_DEPLOYMENTS,
            IndexModel::new("deployment_status").key(KEY_STATUS, IndexOrder::Asc),
        )
        .await
    }
}

pub struct DeviceDeploymentIndexes;

#[async_trait]
impl Migration for DeviceDeploymentIndexes {
    fn version(&self) -> Version {
        Version::new(1, 2, 5)
    }

    async fn up(&self, db: &dyn Database, _scope: Scope) -> Result<()> {
        drop_index(db, COLLECTION_DEVICES, "device_status_created").await?;
        ensure_index(
            db,
            COLLECTION_DEVICES,
            IndexModel::new("device_created_status")
                .key(KEY_DEVICE_ID, IndexOrder::Asc)
                .key(KEY_CREATED, IndexOrder::Desc)
                .key(KEY_STATUS, IndexOrder::Asc),
        )
        .await?;
        ensure_index(
            db,
            COLLECTION_DEVICES,
            IndexModel::new("device_deployment").key(KEY_DEPLOYMENT_ID, IndexOrder::Asc),
        )
        .await
    }
}

pub struct ActiveDeployments;

#[async_trait]
impl Migration for ActiveDeployments {
    fn version(&self) -> Version {
        Version::new(1, 2, 8)
    }

    async fn up(&self, db: &dyn Database, _scope: Scope) -> Result<()> {
        let result = db
            .update_many(
                COLLECTION_DEPLOYMENTS,
                &Filter::ne(KEY_STATUS, DeploymentStatus::Finished.as_str()),
                &Update::new().set(KEY_ACTIVE, true),
            )
            .await
            .during("mark active deployments")?;
        debug!(db = db.name(), modified = result.modified, "active flag backfilled");

        ensure_index(
            db,
            COLLECTION_DEPLOYMENTS,
            IndexModel::new("deployment_active_created")
                .key(KEY_ACTIVE, IndexOrder::Asc)
                .key(KEY_CREATED, IndexOrder::Desc)
                .sparse(),
        )
        .await
    }
}

pub struct ActiveDeviceDeployments;

#[async_trait]
impl Migration for ActiveDeviceDeployments {
    fn version(&self) -> Version {
        Version::new(1, 2, 9)
    }

    async fn up(&self, db: &dyn Database, _scope: Scope) -> Result<()> {
        let active = Filter::is_in(KEY_STATUS, DeviceDeploymentStatus::active_names());
        for (filter, value) in [(active.clone(), true), (Filter::negate(active), false)] {
            db.update_many(COLLECTION_DEVICES, &filter, &Update::new().set(KEY_ACTIVE, value))
                .await
                .during("backfill device deployment active flag")?;
        }

        ensure_index(
            db,
            COLLECTION_DEVICES,
            IndexModel::new("device_active_created")
                .key(KEY_ACTIVE, IndexOrder::Asc)
                .key(KEY_CREATED, IndexOrder::Desc),
        )
        .await
    }
}

pub struct DeviceLogIndex;

#[async_trait]
impl Migration for DeviceLogIndex {
    fn version(&self) -> Version {
        Version::new(1, 2, 11)
    }

    async fn up(&self, db: &dyn Database, _scope: Scope) -> Result<()> {
        ensure_index(
            db,
            COLLECTION_DEVICE_LOGS,
            IndexModel::new("device_deployment_log")
                .key(KEY_DEVICE_ID, IndexOrder::Asc)
                .key(KEY_DEPLOYMENT_ID, IndexOrder::Asc),
        )
        .await
    }
}

/// Last known statuses live in the default database only.
pub struct LastStatusIndex;

#[async_trait]
impl Migration for LastStatusIndex {
    fn version(&self) -> Version {
        Version::new(1, 2, 14)
    }

    async fn up(&self, db: &dyn Database, scope: Scope) -> Result<()> {
        if scope != Scope::Default {
            return Ok(());
        }
        ensure_index(
            db,
            COLLECTION_DEVICES_LAST_STATUS,
            IndexModel::new("last_status_tenant").key("tenant_id", IndexOrder::Asc),
        )
        .await
    }
}

/// Groups artifacts into releases keyed by artifact name. An artifact is
/// pushed only when its release does not list it yet, so re-running the
/// step adds nothing.
pub struct ReleasesFromImages;

#[async_trait]
impl Migration for ReleasesFromImages {
    fn version(&self) -> Version {
        Version::new(1, 2, 15)
    }

    async fn up(&self, db: &dyn Database, _scope: Scope) -> Result<()> {
        ensure_index(
            db,
            COLLECTION_RELEASES,
            IndexModel::new("release_name")
                .key(KEY_RELEASE_NAME, IndexOrder::Asc)
                .unique(),
        )
        .await?;

        let images = db
            .find(COLLECTION_IMAGES, &Filter::All, &FindOptions::default())
            .await
            .during("scan images")?;
        for image in images {
            let (Some(Value::String(name)), Some(id)) =
                (lookup(&image, KEY_IMAGE_NAME).cloned(), image.get(KEY_ID).cloned())
            else {
                continue;
            };
            let filter = Filter::and(vec![
                Filter::eq(KEY_ID, name.as_str()),
                Filter::eq(KEY_RELEASE_NAME, name.as_str()),
                Filter::negate(Filter::elem_match(KEY_RELEASE_ARTIFACTS, KEY_ID, id)),
            ]);
            let update = Update::new()
                .set(KEY_RELEASE_MODIFIED, timestamp::value(&Utc::now()))
                .push(KEY_RELEASE_ARTIFACTS, Value::Object(image));
            match db.update_one(COLLECTION_RELEASES, &filter, &update, true).await {
                Ok(_) => {}
                // the release already lists this artifact
                Err(StoreError::DuplicateKey { .. }) => continue,
                Err(err) => return Err(err).during("upsert release"),
            }
        }
        Ok(())
    }
}

pub struct ReleaseArtifactCount;

#[async_trait]
impl Migration for ReleaseArtifactCount {
    fn version(&self) -> Version {
        Version::new(1, 2, 19)
    }

    async fn up(&self, db: &dyn Database, _scope: Scope) -> Result<()> {
        ensure_index(
            db,
            COLLECTION_RELEASES,
            IndexModel::new("release_artifacts_count")
                .key(KEY_RELEASE_ARTIFACTS_COUNT, IndexOrder::Asc),
        )
        .await?;

        let releases = db
            .find(COLLECTION_RELEASES, &Filter::All, &FindOptions::default())
            .await
            .during("scan releases")?;
        for release in releases {
            let Some(id) = release.get(KEY_ID).cloned() else {
                continue;
            };
            let count = match release.get(KEY_RELEASE_ARTIFACTS) {
                Some(Value::Array(artifacts)) => artifacts.len(),
                _ => 0,
            };
            db.update_one(
                COLLECTION_RELEASES,
                &Filter::eq(KEY_ID, id),
                &Update::new().set(KEY_RELEASE_ARTIFACTS_COUNT, count),
                false,
            )
            .await
            .during("count release artifacts")?;
        }
        Ok(())
    }
}
