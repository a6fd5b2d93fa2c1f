//! Per-deployment counters. Live reports shift one unit between two counters
//! in a single write; recount and replace repair the counters from the
//! device deployments themselves.

use crate::db::{
    COLLECTION_DEPLOYMENTS, COLLECTION_DEVICES, DataStore, KEY_ACTIVE, KEY_DEPLOYMENT_ID,
    KEY_FINISHED, KEY_ID, KEY_STATS, KEY_STATUS, stats_key, timestamp,
};
use crate::deployment::query::{DeploymentStatus, finished_filter, in_progress_filter, pending_filter};
use crate::error::{Error, Result, StoreContext};
use crate::status::DeviceDeploymentStatus;
use crate::store::{Database, Filter, Update};
use crate::tenant::TenantId;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

pub mod schema;

pub use schema::Stats;

/// True when no device is active and at least one has an outcome.
fn all_terminal_filter() -> Filter {
    let mut terms: Vec<Filter> = DeviceDeploymentStatus::ACTIVE
        .iter()
        .map(|status| Filter::negate(Filter::gt(&stats_key(status.as_str()), 0)))
        .collect();
    terms.push(Filter::or(
        DeviceDeploymentStatus::TERMINAL
            .iter()
            .map(|status| Filter::gt(&stats_key(status.as_str()), 0))
            .collect(),
    ));
    Filter::and(terms)
}

/// Operations appended to every counter write: marks the deployment finished
/// once all devices are terminal and recomputes the cached `status` and
/// `active` fields from the counters just written.
pub fn derived_fields(now: DateTime<Utc>) -> Update {
    Update::new()
        .set_when(
            KEY_FINISHED,
            vec![(
                Filter::and(vec![
                    Filter::eq(KEY_FINISHED, Value::Null),
                    all_terminal_filter(),
                ]),
                timestamp::value(&now),
            )],
        )
        .set_when(
            KEY_STATUS,
            vec![
                (finished_filter(), DeploymentStatus::Finished.as_str().into()),
                (in_progress_filter(), DeploymentStatus::InProgress.as_str().into()),
                (pending_filter(), DeploymentStatus::Pending.as_str().into()),
            ],
        )
        .set_when(
            KEY_ACTIVE,
            vec![(finished_filter(), false.into()), (Filter::All, true.into())],
        )
}

fn validate_id(deployment_id: &str) -> Result<()> {
    if deployment_id.trim().is_empty() {
        return Err(Error::InvalidId("deployment id is empty".to_string()));
    }
    Ok(())
}

/// Moves one device from `from` to `to` on the deployment's counters.
#[tracing::instrument(skip(store))]
pub async fn transition_count(
    store: &DataStore,
    tenant: Option<&TenantId>,
    deployment_id: &str,
    from: DeviceDeploymentStatus,
    to: DeviceDeploymentStatus,
) -> Result<()> {
    validate_id(deployment_id)?;
    if from == to {
        return Ok(());
    }

    let update = Update::new()
        .inc(&stats_key(from.as_str()), -1)
        .inc(&stats_key(to.as_str()), 1)
        .extend(derived_fields(Utc::now()));
    let result = store
        .database(tenant)
        .update_one(
            COLLECTION_DEPLOYMENTS,
            &Filter::eq(KEY_ID, deployment_id),
            &update,
            false,
        )
        .await
        .during("transition count")?;
    if result.matched == 0 {
        return Err(Error::NotFound("deployment"));
    }
    Ok(())
}

/// Overwrites all counters in one write.
#[tracing::instrument(skip(store, stats))]
pub async fn replace_count(
    store: &DataStore,
    tenant: Option<&TenantId>,
    deployment_id: &str,
    stats: &Stats,
) -> Result<()> {
    replace_count_in(store.database(tenant).as_ref(), deployment_id, stats).await
}

pub async fn replace_count_in(db: &dyn Database, deployment_id: &str, stats: &Stats) -> Result<()> {
    validate_id(deployment_id)?;

    let update = Update::new()
        .set(KEY_STATS, stats.to_value())
        .extend(derived_fields(Utc::now()));
    let result = db
        .update_one(
            COLLECTION_DEPLOYMENTS,
            &Filter::eq(KEY_ID, deployment_id),
            &update,
            false,
        )
        .await
        .during("replace count")?;
    if result.matched == 0 {
        return Err(Error::InvalidId(format!("no deployment '{deployment_id}'")));
    }
    Ok(())
}

/// Counts the deployment's device deployments per status.
#[tracing::instrument(skip(store))]
pub async fn recount(
    store: &DataStore,
    tenant: Option<&TenantId>,
    deployment_id: &str,
) -> Result<Stats> {
    recount_in(store.database(tenant).as_ref(), deployment_id).await
}

pub async fn recount_in(db: &dyn Database, deployment_id: &str) -> Result<Stats> {
    validate_id(deployment_id)?;

    let groups = db
        .count_by(
            COLLECTION_DEVICES,
            &Filter::eq(KEY_DEPLOYMENT_ID, deployment_id),
            KEY_STATUS,
        )
        .await
        .during("recount")?;

    let mut stats = Stats::new();
    for (status, count) in groups {
        match status.as_str().map(str::parse::<DeviceDeploymentStatus>) {
            Some(Ok(status)) => stats.increment(status, count as i64),
            _ => warn!(deployment_id, status = %status, count, "skipping unknown device status"),
        }
    }
    debug!(deployment_id, total = stats.total(), "recounted");
    Ok(stats)
}

/// Recount followed by replace; the repair path for counters that drifted
/// from the device deployments.
pub async fn reconcile(
    store: &DataStore,
    tenant: Option<&TenantId>,
    deployment_id: &str,
) -> Result<Stats> {
    let stats = recount(store, tenant, deployment_id).await?;
    replace_count(store, tenant, deployment_id, &stats).await?;
    info!(deployment_id, "deployment counters reconciled");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Document;
    use crate::store::memory::MemoryClient;
    use DeviceDeploymentStatus::*;
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> DataStore {
        DataStore::with_default_name(Arc::new(MemoryClient::new()))
    }

    async fn seed_deployment(store: &DataStore, id: &str, stats: &Stats) {
        let doc = json!({
            "_id": id,
            "stats": stats.to_value(),
            "status": "pending",
            "active": true,
            "finished": null,
        });
        store
            .database(None)
            .insert_many(COLLECTION_DEPLOYMENTS, vec![doc.as_object().cloned().unwrap()])
            .await
            .unwrap();
    }

    async fn load(store: &DataStore, id: &str) -> Document {
        store
            .database(None)
            .find_one(COLLECTION_DEPLOYMENTS, &Filter::eq(KEY_ID, id))
            .await
            .unwrap()
            .unwrap()
    }

    fn stats_of(doc: &Document) -> Stats {
        serde_json::from_value(doc[KEY_STATS].clone()).unwrap()
    }

    #[tokio::test]
    async fn transition_moves_exactly_one_unit() {
        let store = store();
        let initial = Stats::new().with(Pending, 2).with(Downloading, 1);
        seed_deployment(&store, "d1", &initial).await;

        transition_count(&store, None, "d1", Pending, Installing).await.unwrap();

        let stats = stats_of(&load(&store, "d1").await);
        assert_eq!(stats.get(Pending), 1);
        assert_eq!(stats.get(Installing), 1);
        for status in DeviceDeploymentStatus::ALL {
            if status != Pending && status != Installing {
                assert_eq!(stats.get(status), initial.get(status), "{status}");
            }
        }
        assert_eq!(stats.total(), initial.total());
    }

    #[tokio::test]
    async fn same_status_transition_does_not_write() {
        let store = store();
        // no deployment exists, so any write attempt would fail
        transition_count(&store, None, "missing", Success, Success).await.unwrap();
        assert!(
            store
                .database(None)
                .find_one(COLLECTION_DEPLOYMENTS, &Filter::All)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn transition_errors() {
        let store = store();
        assert!(matches!(
            transition_count(&store, None, "", Pending, Success).await,
            Err(Error::InvalidId(_))
        ));
        assert!(matches!(
            transition_count(&store, None, "missing", Pending, Success).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            replace_count(&store, None, "missing", &Stats::new()).await,
            Err(Error::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn three_reports_leave_deployment_in_progress() {
        let store = store();
        seed_deployment(&store, "d1", &Stats::new().with(Pending, 3)).await;

        transition_count(&store, None, "d1", Pending, Downloading).await.unwrap();
        transition_count(&store, None, "d1", Pending, Downloading).await.unwrap();
        transition_count(&store, None, "d1", Downloading, Success).await.unwrap();

        let doc = load(&store, "d1").await;
        assert_eq!(
            stats_of(&doc),
            Stats::new().with(Pending, 1).with(Downloading, 1).with(Success, 1)
        );
        assert_eq!(doc[KEY_STATUS], json!("inprogress"));
        assert_eq!(doc[KEY_ACTIVE], json!(true));
        assert_eq!(doc[KEY_FINISHED], Value::Null);
    }

    #[tokio::test]
    async fn last_terminal_report_finishes_deployment() {
        let store = store();
        seed_deployment(&store, "d1", &Stats::new().with(Pending, 1).with(Success, 2)).await;

        transition_count(&store, None, "d1", Pending, Success).await.unwrap();

        let doc = load(&store, "d1").await;
        assert_eq!(stats_of(&doc), Stats::new().with(Success, 3));
        assert!(doc[KEY_FINISHED].is_string());
        assert_eq!(doc[KEY_STATUS], json!("finished"));
        assert_eq!(doc[KEY_ACTIVE], json!(false));

        // finished is set once
        let finished = doc[KEY_FINISHED].clone();
        replace_count(&store, None, "d1", &Stats::new().with(Success, 2).with(Failure, 1))
            .await
            .unwrap();
        assert_eq!(load(&store, "d1").await[KEY_FINISHED], finished);
    }

    #[tokio::test]
    async fn reconcile_rebuilds_counters_from_devices() {
        let store = store();
        seed_deployment(&store, "d1", &Stats::new().with(Pending, 3)).await;
        let devices = [("a", "success"), ("b", "aborted"), ("c", "failure")]
            .into_iter()
            .map(|(device, status)| {
                json!({"_id": device, "deploymentid": "d1", "deviceid": device, "status": status})
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect();
        store
            .database(None)
            .insert_many(COLLECTION_DEVICES, devices)
            .await
            .unwrap();

        let stats = reconcile(&store, None, "d1").await.unwrap();

        assert_eq!(
            stats,
            Stats::new().with(Success, 1).with(Aborted, 1).with(Failure, 1)
        );
        let doc = load(&store, "d1").await;
        assert_eq!(stats_of(&doc), stats);
        assert_eq!(doc[KEY_STATUS], json!("finished"));
    }

    #[tokio::test]
    async fn tenant_counters_are_isolated() {
        let store = store();
        let tenant = TenantId::new("acme").unwrap();
        seed_deployment(&store, "d1", &Stats::new().with(Pending, 1)).await;

        assert!(matches!(
            transition_count(&store, Some(&tenant), "d1", Pending, Downloading).await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(stats_of(&load(&store, "d1").await).get(Pending), 1);
    }
}
