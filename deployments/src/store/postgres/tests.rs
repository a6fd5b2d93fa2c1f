//! Runs against a live server; set `DATABASE_URL` and pass `--ignored`.

use super::*;
use crate::db::{
    COLLECTION_DEPLOYMENTS, COLLECTION_DEVICES, COLLECTION_IMAGES, COLLECTION_MIGRATIONS,
    COLLECTION_RELEASES, DataStore,
};
use crate::deployment::{DeploymentConstructor, DeploymentStatus, StatusQuery};
use crate::migrations::{self, Migration, Migrator, Scope, Version};
use crate::stats::{self, Stats};
use crate::status::DeviceDeploymentStatus::{self, *};
use crate::status::schema::StatusReport;
use crate::tenant::{TenantId, db_name};
use crate::Deployments;
use serde_json::json;
use std::collections::BTreeSet;

struct Scratch {
    pool: PgPool,
    store: DataStore,
}

impl Scratch {
    async fn new() -> Option<Self> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL is not set, skipping");
            return None;
        };
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .unwrap();
        let base = format!("t_{}", uuid::Uuid::new_v4().simple());
        let store = DataStore::new(Arc::new(PgClient::new(pool.clone())), &base);
        Some(Self { pool, store })
    }

    async fn cleanup(self, tenants: &[&TenantId]) {
        let mut names = vec![db_name(self.store.db_name(), None)];
        names.extend(tenants.iter().map(|t| db_name(self.store.db_name(), Some(t))));
        for name in names {
            sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(&name)))
                .execute(&self.pool)
                .await
                .unwrap();
        }
    }
}

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn reports_drive_counters_to_finished() {
    let Some(scratch) = Scratch::new().await else {
        return;
    };
    let acme = TenantId::new("acme").unwrap();
    let tenant = Some(&acme);
    scratch
        .store
        .database(tenant)
        .insert_many(
            COLLECTION_IMAGES,
            vec![doc(json!({"_id": "artifact-1", "meta_artifact": {"name": "rootfs-v2"}}))],
        )
        .await
        .unwrap();
    let app = Deployments::new(DataStore::new(
        scratch.store.client().clone(),
        scratch.store.db_name(),
    ));
    let constructor = DeploymentConstructor {
        name: "fleet".to_string(),
        artifact_name: "rootfs-v2".to_string(),
        devices: vec!["a".to_string(), "b".to_string()],
    };
    let id = app.create_deployment(tenant, constructor).await.unwrap();

    app.report_status(tenant, "a", &id, StatusReport::new(Downloading)).await.unwrap();
    app.report_status(tenant, "a", &id, StatusReport::new(Downloading)).await.unwrap();

    let deployment = app.deployment(tenant, &id).await.unwrap().unwrap();
    assert_eq!(deployment.stats, Stats::new().with(Pending, 1).with(Downloading, 1));
    assert_eq!(deployment.status, DeploymentStatus::InProgress);

    app.report_status(tenant, "a", &id, StatusReport::new(Success)).await.unwrap();
    app.report_status(tenant, "b", &id, StatusReport::new(Failure)).await.unwrap();

    let deployment = app.deployment(tenant, &id).await.unwrap().unwrap();
    assert_eq!(deployment.stats, Stats::new().with(Success, 1).with(Failure, 1));
    assert_eq!(deployment.status, DeploymentStatus::Finished);
    assert!(deployment.is_finished());
    assert_eq!(
        deployment.stats,
        stats::recount(app.store(), tenant, &id).await.unwrap()
    );
    let rows = app
        .store()
        .database(tenant)
        .count(COLLECTION_DEVICES, &Filter::All)
        .await
        .unwrap();
    assert_eq!(rows, 2);

    scratch.cleanup(&[&acme]).await;
}

// Every counter vector with at most two devices, plus stored shapes that
// omit counters or carry negative ones.
fn stored_vectors() -> Vec<Document> {
    let mut vectors = vec![Stats::new()];
    for status in DeviceDeploymentStatus::ALL {
        vectors = vectors
            .into_iter()
            .flat_map(|stats| {
                let used = stats.total();
                (0..=2 - used).map(move |count| stats.clone().with(status, count))
            })
            .collect();
    }
    let mut docs = Vec::new();
    for stats in vectors {
        for finished in [Value::Null, json!("2024-05-01T10:00:00.000000Z")] {
            docs.push(json!({"stats": stats.to_value(), "finished": finished}));
        }
    }
    docs.push(json!({"stats": {"pending": 3}, "finished": null}));
    docs.push(json!({"stats": {"pending": 1, "downloading": -1}, "finished": null}));
    docs.push(json!({"stats": {"pending": 1, "success": 1, "failure": -1}, "finished": null}));
    docs.into_iter()
        .enumerate()
        .map(|(i, mut value)| {
            value["_id"] = json!(format!("v{i:04}"));
            doc(value)
        })
        .collect()
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn stored_filters_agree_with_classification() {
    let Some(scratch) = Scratch::new().await else {
        return;
    };
    let db = scratch.store.default_database();
    let docs = stored_vectors();
    db.insert_many(COLLECTION_DEPLOYMENTS, docs.clone()).await.unwrap();

    for query in [
        StatusQuery::Any,
        StatusQuery::Pending,
        StatusQuery::InProgress,
        StatusQuery::Finished,
    ] {
        let expected: BTreeSet<String> = docs
            .iter()
            .filter(|doc| {
                let stats: Stats = serde_json::from_value(doc["stats"].clone()).unwrap();
                query.matches(&stats, !doc["finished"].is_null())
            })
            .map(|doc| doc["_id"].as_str().unwrap().to_string())
            .collect();
        let found: BTreeSet<String> = db
            .find(COLLECTION_DEPLOYMENTS, &query.filter(), &FindOptions::default())
            .await
            .unwrap()
            .iter()
            .map(|doc| doc["_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(found, expected, "{query:?}");
        assert_eq!(
            db.count(COLLECTION_DEPLOYMENTS, &query.filter()).await.unwrap(),
            expected.len() as u64
        );
    }

    scratch.cleanup(&[]).await;
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn migrations_run_twice_change_nothing() {
    let Some(scratch) = Scratch::new().await else {
        return;
    };
    let acme = TenantId::new("acme").unwrap();
    let db = scratch.store.database(Some(&acme));
    db.insert_many(
        COLLECTION_DEPLOYMENTS,
        vec![doc(json!({"_id": "d1", "stats": {"pending": 1}, "status": "pending", "finished": null}))],
    )
    .await
    .unwrap();
    db.insert_many(
        COLLECTION_DEVICES,
        vec![doc(json!({"_id": "a", "deploymentid": "d1", "deviceid": "dev-a", "status": "success"}))],
    )
    .await
    .unwrap();
    db.insert_many(
        COLLECTION_IMAGES,
        vec![doc(json!({"_id": "img-1", "meta_artifact": {"name": "rootfs-v1"}}))],
    )
    .await
    .unwrap();

    let migrator = Migrator::new(migrations::all(), Version::new(1, 2, 19), true);
    migrations::migrate_all(&scratch.store, &migrator).await.unwrap();

    let collections = [
        COLLECTION_DEPLOYMENTS,
        COLLECTION_DEVICES,
        COLLECTION_RELEASES,
        COLLECTION_MIGRATIONS,
    ];
    let mut before = Vec::new();
    for collection in collections {
        before.push((
            db.find(collection, &Filter::All, &FindOptions::default()).await.unwrap(),
            db.list_indexes(collection).await.unwrap(),
        ));
    }
    let finished = &before[0].0[0]["finished"];
    assert!(finished.is_string(), "{finished}");

    migrations::migrate_all(&scratch.store, &migrator).await.unwrap();
    for step in migrations::all() {
        step.up(db.as_ref(), Scope::Tenant).await.unwrap();
    }

    for (collection, (docs, indexes)) in collections.into_iter().zip(before) {
        let mut after = db.find(collection, &Filter::All, &FindOptions::default()).await.unwrap();
        let mut docs = docs;
        after.sort_by_key(|doc| doc["_id"].to_string());
        docs.sort_by_key(|doc| doc["_id"].to_string());
        assert_eq!(after, docs, "{collection}");
        assert_eq!(db.list_indexes(collection).await.unwrap(), indexes, "{collection}");
    }

    scratch.cleanup(&[&acme]).await;
}
