//! Last known status per device. Kept in the default database for all
//! tenants and scoped by the `tenant_id` field.

use crate::db::{COLLECTION_DEVICES_LAST_STATUS, DataStore, KEY_ID};
use crate::device_deployment::schema::{DeviceDeployment, LastStatus};
use crate::error::{Error, Result, StoreContext};
use crate::store::{Filter, StoreError};
use crate::tenant::TenantId;

const KEY_TENANT_ID: &str = "tenant_id";

pub async fn save_last_status(
    store: &DataStore,
    tenant: Option<&TenantId>,
    device_deployment: &DeviceDeployment,
) -> Result<()> {
    let record = LastStatus {
        device_id: device_deployment.device_id.clone(),
        deployment_id: device_deployment.deployment_id.clone(),
        device_deployment_id: device_deployment.id.clone(),
        device_deployment_status: device_deployment.status,
        tenant_id: tenant.map(|t| t.to_string()).unwrap_or_default(),
    };
    let doc = match serde_json::to_value(&record) {
        Ok(serde_json::Value::Object(doc)) => doc,
        _ => return Err(Error::InvalidInput("last status record".to_string())),
    };
    store
        .default_database()
        .replace_one(
            COLLECTION_DEVICES_LAST_STATUS,
            &Filter::eq(KEY_ID, record.device_id.as_str()),
            doc,
            true,
        )
        .await
        .during("save last status")?;
    Ok(())
}

pub async fn last_status_per_device(
    store: &DataStore,
    tenant: Option<&TenantId>,
    device_ids: &[String],
) -> Result<Vec<LastStatus>> {
    let tenant = tenant.ok_or(Error::TenantRequired)?;
    let filter = Filter::and(vec![
        Filter::is_in(KEY_ID, device_ids.iter().map(String::as_str)),
        Filter::eq(KEY_TENANT_ID, tenant.as_str()),
    ]);
    store
        .default_database()
        .find(COLLECTION_DEVICES_LAST_STATUS, &filter, &Default::default())
        .await
        .during("last status per device")?
        .into_iter()
        .map(|doc| {
            serde_json::from_value(serde_json::Value::Object(doc)).map_err(|err| {
                Error::StoreUnavailable {
                    operation: "decode last status",
                    source: StoreError::Malformed(err),
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::DeviceDeploymentStatus;
    use crate::store::Client;
    use crate::store::memory::MemoryClient;
    use std::sync::Arc;

    #[tokio::test]
    async fn latest_report_wins_per_tenant() {
        let store = DataStore::with_default_name(Arc::new(MemoryClient::new()));
        let acme = TenantId::new("acme").unwrap();
        let other = TenantId::new("other").unwrap();

        let mut first = DeviceDeployment::new("dev-1", "dep-1");
        first.status = DeviceDeploymentStatus::Downloading;
        save_last_status(&store, Some(&acme), &first).await.unwrap();
        let mut second = DeviceDeployment::new("dev-1", "dep-2");
        second.status = DeviceDeploymentStatus::Success;
        save_last_status(&store, Some(&acme), &second).await.unwrap();
        save_last_status(&store, Some(&other), &DeviceDeployment::new("dev-2", "dep-9"))
            .await
            .unwrap();

        let ids = vec!["dev-1".to_string(), "dev-2".to_string()];
        let statuses = last_status_per_device(&store, Some(&acme), &ids).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].deployment_id, "dep-2");
        assert_eq!(statuses[0].device_deployment_status, DeviceDeploymentStatus::Success);

        // stored in the default database only
        assert!(
            store
                .client()
                .list_databases()
                .await
                .unwrap()
                .iter()
                .all(|db| db == "deployment_service")
        );
    }

    #[tokio::test]
    async fn tenant_is_required() {
        let store = DataStore::with_default_name(Arc::new(MemoryClient::new()));
        assert!(matches!(
            last_status_per_device(&store, None, &["dev-1".to_string()]).await,
            Err(Error::TenantRequired)
        ));
    }
}
