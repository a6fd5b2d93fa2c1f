//! Per-device deployment records and their status transitions.

use crate::db::{
    COLLECTION_DEVICES, DataStore, KEY_ACTIVE, KEY_CREATED, KEY_DEPLOYMENT_ID, KEY_DEVICE_ID,
    KEY_FINISHED, KEY_ID, KEY_IMAGE, KEY_LOG, KEY_STATUS, KEY_SUBSTATE, timestamp,
};
use crate::error::{Error, Result, StoreContext};
use crate::status::DeviceDeploymentStatus;
use crate::store::{Document, Filter, FindOptions, ReturnDocument, SortOrder, StoreError, Update};
use crate::tenant::TenantId;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

pub mod last_status;
pub mod schema;

pub use last_status::{last_status_per_device, save_last_status};
pub use schema::{DeviceDeployment, LastStatus};

fn require_id(kind: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::InvalidId(format!("{kind} id is empty")));
    }
    Ok(())
}

fn pair(device_id: &str, deployment_id: &str) -> Filter {
    Filter::and(vec![
        Filter::eq(KEY_DEVICE_ID, device_id),
        Filter::eq(KEY_DEPLOYMENT_ID, deployment_id),
    ])
}

fn active() -> Filter {
    Filter::is_in(KEY_STATUS, DeviceDeploymentStatus::active_names())
}

fn decode(doc: Document) -> Result<DeviceDeployment> {
    serde_json::from_value(Value::Object(doc)).map_err(|err| Error::StoreUnavailable {
        operation: "decode device deployment",
        source: StoreError::Malformed(err),
    })
}

fn status_of_doc(doc: &Document) -> Result<DeviceDeploymentStatus> {
    doc.get(KEY_STATUS)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .parse()
}

/// Moves every matched row to the terminal `status`.
fn terminate(status: DeviceDeploymentStatus, now: DateTime<Utc>) -> Update {
    Update::new()
        .set(KEY_STATUS, status.as_str())
        .set(KEY_ACTIVE, false)
        .set(KEY_FINISHED, timestamp::value(&now))
}

pub async fn insert_many(
    store: &DataStore,
    tenant: Option<&TenantId>,
    device_deployments: &[DeviceDeployment],
) -> Result<()> {
    if device_deployments.is_empty() {
        return Ok(());
    }
    let docs = device_deployments
        .iter()
        .map(|dd| match serde_json::to_value(dd) {
            Ok(Value::Object(doc)) => Ok(doc),
            Ok(_) => Err(Error::InvalidInput("device deployment".to_string())),
            Err(err) => Err(Error::StoreUnavailable {
                operation: "encode device deployment",
                source: StoreError::Malformed(err),
            }),
        })
        .collect::<Result<Vec<_>>>()?;
    store
        .database(tenant)
        .insert_many(COLLECTION_DEVICES, docs)
        .await
        .during("insert device deployments")
}

/// Sets the status of the (device, deployment) row and returns the status
/// it had immediately before the write.
#[tracing::instrument(skip(store))]
pub async fn apply_status(
    store: &DataStore,
    tenant: Option<&TenantId>,
    device_id: &str,
    deployment_id: &str,
    status: DeviceDeploymentStatus,
    substate: Option<&str>,
    finished: Option<DateTime<Utc>>,
) -> Result<DeviceDeploymentStatus> {
    require_id("device", device_id)?;
    require_id("deployment", deployment_id)?;

    let mut update = Update::new()
        .set(KEY_STATUS, status.as_str())
        .set(KEY_ACTIVE, status.is_active());
    if let Some(substate) = substate {
        update = update.set(KEY_SUBSTATE, substate);
    }
    if let Some(finished) = finished {
        update = update.set(KEY_FINISHED, timestamp::value(&finished));
    }

    let previous = store
        .database(tenant)
        .find_one_and_update(
            COLLECTION_DEVICES,
            &pair(device_id, deployment_id),
            &update,
            ReturnDocument::Before,
        )
        .await
        .during("apply status")?
        .ok_or(Error::NotFound("device deployment"))?;
    status_of_doc(&previous)
}

/// Aborts every active row of the deployment; terminal rows are left as
/// they are. Returns the number of rows aborted.
#[tracing::instrument(skip(store))]
pub async fn abort_all(
    store: &DataStore,
    tenant: Option<&TenantId>,
    deployment_id: &str,
) -> Result<u64> {
    require_id("deployment", deployment_id)?;

    let result = store
        .database(tenant)
        .update_many(
            COLLECTION_DEVICES,
            &Filter::and(vec![Filter::eq(KEY_DEPLOYMENT_ID, deployment_id), active()]),
            &terminate(DeviceDeploymentStatus::Aborted, Utc::now()),
        )
        .await
        .during("abort device deployments")?;
    info!(deployment_id, aborted = result.modified, "aborted device deployments");
    Ok(result.modified)
}

/// Decommissions every active row of the device and returns the ids of the
/// deployments that were touched.
#[tracing::instrument(skip(store))]
pub async fn decommission_all(
    store: &DataStore,
    tenant: Option<&TenantId>,
    device_id: &str,
) -> Result<Vec<String>> {
    require_id("device", device_id)?;

    let db = store.database(tenant);
    let candidates = db
        .find(
            COLLECTION_DEVICES,
            &Filter::and(vec![Filter::eq(KEY_DEVICE_ID, device_id), active()]),
            &FindOptions::default(),
        )
        .await
        .during("find active device deployments")?;

    let now = Utc::now();
    let mut deployments = Vec::new();
    for candidate in candidates {
        let Some(id) = candidate.get(KEY_ID).cloned() else {
            continue;
        };
        // The row may have finished since it was read.
        let updated = db
            .find_one_and_update(
                COLLECTION_DEVICES,
                &Filter::and(vec![Filter::eq(KEY_ID, id), active()]),
                &terminate(DeviceDeploymentStatus::Decommissioned, now),
                ReturnDocument::After,
            )
            .await
            .during("decommission device deployment")?;
        if let Some(deployment_id) = updated
            .as_ref()
            .and_then(|doc| doc.get(KEY_DEPLOYMENT_ID))
            .and_then(Value::as_str)
        {
            deployments.push(deployment_id.to_string());
        }
    }
    debug!(device_id, count = deployments.len(), "decommissioned device deployments");
    Ok(deployments)
}

pub async fn find(
    store: &DataStore,
    tenant: Option<&TenantId>,
    device_id: &str,
    deployment_id: &str,
) -> Result<Option<DeviceDeployment>> {
    require_id("device", device_id)?;
    require_id("deployment", deployment_id)?;
    store
        .database(tenant)
        .find_one(COLLECTION_DEVICES, &pair(device_id, deployment_id))
        .await
        .during("find device deployment")?
        .map(decode)
        .transpose()
}

pub async fn status(
    store: &DataStore,
    tenant: Option<&TenantId>,
    device_id: &str,
    deployment_id: &str,
) -> Result<Option<DeviceDeploymentStatus>> {
    Ok(find(store, tenant, device_id, deployment_id)
        .await?
        .map(|dd| dd.status))
}

pub async fn has_deployment(
    store: &DataStore,
    tenant: Option<&TenantId>,
    device_id: &str,
    deployment_id: &str,
) -> Result<bool> {
    Ok(find(store, tenant, device_id, deployment_id).await?.is_some())
}

/// All rows of a deployment, oldest first.
pub async fn for_deployment(
    store: &DataStore,
    tenant: Option<&TenantId>,
    deployment_id: &str,
) -> Result<Vec<DeviceDeployment>> {
    require_id("deployment", deployment_id)?;
    store
        .database(tenant)
        .find(
            COLLECTION_DEVICES,
            &Filter::eq(KEY_DEPLOYMENT_ID, deployment_id),
            &FindOptions::sorted(KEY_CREATED, SortOrder::Asc),
        )
        .await
        .during("find device deployments")?
        .into_iter()
        .map(decode)
        .collect()
}

pub async fn device_count(
    store: &DataStore,
    tenant: Option<&TenantId>,
    deployment_id: &str,
) -> Result<u64> {
    require_id("deployment", deployment_id)?;
    store
        .database(tenant)
        .count(COLLECTION_DEVICES, &Filter::eq(KEY_DEPLOYMENT_ID, deployment_id))
        .await
        .during("count device deployments")
}

async fn set_field(
    store: &DataStore,
    tenant: Option<&TenantId>,
    device_id: &str,
    deployment_id: &str,
    update: Update,
    operation: &'static str,
) -> Result<()> {
    require_id("device", device_id)?;
    require_id("deployment", deployment_id)?;
    let result = store
        .database(tenant)
        .update_one(COLLECTION_DEVICES, &pair(device_id, deployment_id), &update, false)
        .await
        .during(operation)?;
    if result.matched == 0 {
        return Err(Error::NotFound("device deployment"));
    }
    Ok(())
}

pub async fn set_log_available(
    store: &DataStore,
    tenant: Option<&TenantId>,
    device_id: &str,
    deployment_id: &str,
    available: bool,
) -> Result<()> {
    let update = Update::new().set(KEY_LOG, available);
    set_field(store, tenant, device_id, deployment_id, update, "set log flag").await
}

pub async fn assign_artifact(
    store: &DataStore,
    tenant: Option<&TenantId>,
    device_id: &str,
    deployment_id: &str,
    artifact: Value,
) -> Result<()> {
    let update = Update::new().set(KEY_IMAGE, artifact);
    set_field(store, tenant, device_id, deployment_id, update, "assign artifact").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryClient;
    use DeviceDeploymentStatus::*;
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> DataStore {
        DataStore::with_default_name(Arc::new(MemoryClient::new()))
    }

    async fn seed(store: &DataStore, rows: &[(&str, &str, DeviceDeploymentStatus)]) {
        let rows: Vec<DeviceDeployment> = rows
            .iter()
            .map(|(device, deployment, status)| {
                let mut dd = DeviceDeployment::new(device, deployment);
                dd.status = *status;
                dd.active = status.is_active();
                dd
            })
            .collect();
        insert_many(store, None, &rows).await.unwrap();
    }

    async fn statuses(store: &DataStore, deployment_id: &str) -> Vec<(String, DeviceDeploymentStatus)> {
        let mut rows: Vec<_> = for_deployment(store, None, deployment_id)
            .await
            .unwrap()
            .into_iter()
            .map(|dd| (dd.device_id, dd.status))
            .collect();
        rows.sort();
        rows
    }

    #[tokio::test]
    async fn apply_status_returns_previous_status() {
        let store = store();
        seed(&store, &[("dev-1", "dep-1", Pending)]).await;

        let previous = apply_status(&store, None, "dev-1", "dep-1", Downloading, Some("fetching"), None)
            .await
            .unwrap();
        assert_eq!(previous, Pending);

        let finished = Utc::now();
        let previous = apply_status(&store, None, "dev-1", "dep-1", Success, None, Some(finished))
            .await
            .unwrap();
        assert_eq!(previous, Downloading);

        let row = find(&store, None, "dev-1", "dep-1").await.unwrap().unwrap();
        assert_eq!(row.status, Success);
        assert_eq!(row.substate.as_deref(), Some("fetching"));
        assert!(!row.active);
        assert_eq!(row.finished.map(|f| f.timestamp_micros()), Some(finished.timestamp_micros()));
    }

    #[tokio::test]
    async fn apply_status_errors() {
        let store = store();
        assert!(matches!(
            apply_status(&store, None, "", "dep-1", Success, None, None).await,
            Err(Error::InvalidId(_))
        ));
        assert!(matches!(
            apply_status(&store, None, "dev-1", "dep-1", Success, None, None).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn abort_all_touches_only_active_rows() {
        let store = store();
        seed(
            &store,
            &[
                ("a", "dep-1", Pending),
                ("b", "dep-1", Success),
                ("c", "dep-1", Aborted),
                ("d", "dep-2", Downloading),
            ],
        )
        .await;

        assert_eq!(abort_all(&store, None, "dep-1").await.unwrap(), 1);

        assert_eq!(
            statuses(&store, "dep-1").await,
            vec![
                ("a".to_string(), Aborted),
                ("b".to_string(), Success),
                ("c".to_string(), Aborted)
            ]
        );
        assert_eq!(statuses(&store, "dep-2").await, vec![("d".to_string(), Downloading)]);
        // nothing left to abort
        assert_eq!(abort_all(&store, None, "dep-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn decommission_all_reports_touched_deployments() {
        let store = store();
        seed(
            &store,
            &[
                ("dev-1", "dep-1", Installing),
                ("dev-1", "dep-2", Failure),
                ("dev-1", "dep-3", PauseBeforeCommitting),
                ("dev-2", "dep-1", Pending),
            ],
        )
        .await;

        let mut touched = decommission_all(&store, None, "dev-1").await.unwrap();
        touched.sort();
        assert_eq!(touched, vec!["dep-1".to_string(), "dep-3".to_string()]);
        assert_eq!(status(&store, None, "dev-1", "dep-2").await.unwrap(), Some(Failure));
        assert_eq!(status(&store, None, "dev-2", "dep-1").await.unwrap(), Some(Pending));

        assert!(decommission_all(&store, None, "dev-1").await.unwrap().is_empty());
        assert!(decommission_all(&store, None, "unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn helpers() {
        let store = store();
        seed(&store, &[("dev-1", "dep-1", Pending), ("dev-2", "dep-1", Pending)]).await;

        assert!(has_deployment(&store, None, "dev-1", "dep-1").await.unwrap());
        assert!(!has_deployment(&store, None, "dev-1", "dep-9").await.unwrap());
        assert_eq!(device_count(&store, None, "dep-1").await.unwrap(), 2);

        set_log_available(&store, None, "dev-1", "dep-1", true).await.unwrap();
        assign_artifact(&store, None, "dev-1", "dep-1", json!({"_id": "a1", "name": "rootfs"}))
            .await
            .unwrap();
        let row = find(&store, None, "dev-1", "dep-1").await.unwrap().unwrap();
        assert!(row.log);
        assert_eq!(row.image, Some(json!({"_id": "a1", "name": "rootfs"})));

        assert!(matches!(
            set_log_available(&store, None, "dev-3", "dep-1", true).await,
            Err(Error::NotFound(_))
        ));
    }
}
