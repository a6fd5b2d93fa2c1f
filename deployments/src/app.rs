//! Workflows spanning several documents. None of them is transactional:
//! each step is a single-document write and counters that may have drifted
//! are repaired by recounting.

use crate::db::{COLLECTION_IMAGES, DataStore, KEY_ID, KEY_IMAGE_NAME};
use crate::deployment::{Deployment, DeploymentConstructor, Query};
use crate::device_deployment::{self, DeviceDeployment, LastStatus};
use crate::error::{Error, Result, StoreContext};
use crate::stats::{self, Stats};
use crate::status::DeviceDeploymentStatus;
use crate::status::schema::StatusReport;
use crate::store::{Filter, FindOptions};
use crate::tenant::TenantId;
use chrono::Utc;
use serde_json::Value;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct Deployments {
    store: DataStore,
}

impl Deployments {
    pub fn new(store: DataStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    /// Creates a deployment and one pending device deployment per target
    /// device. The deployment is removed again if the device deployments
    /// cannot be written.
    #[tracing::instrument(skip(self))]
    pub async fn create_deployment(
        &self,
        tenant: Option<&TenantId>,
        constructor: DeploymentConstructor,
    ) -> Result<String> {
        constructor.validate()?;

        let artifacts = self
            .store
            .database(tenant)
            .find(
                COLLECTION_IMAGES,
                &Filter::eq(KEY_IMAGE_NAME, constructor.artifact_name.as_str()),
                &FindOptions::default(),
            )
            .await
            .during("find artifacts")?;
        if artifacts.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no artifact named '{}'",
                constructor.artifact_name
            )));
        }
        let artifact_ids = artifacts
            .iter()
            .filter_map(|artifact| artifact.get(KEY_ID).and_then(Value::as_str))
            .map(str::to_string)
            .collect();

        let devices = constructor.devices.clone();
        let deployment = Deployment::new(constructor, artifact_ids);
        deployment.insert(&self.store, tenant).await?;

        let rows: Vec<DeviceDeployment> = devices
            .iter()
            .map(|device| DeviceDeployment::new(device, &deployment.id))
            .collect();
        if let Err(err) = device_deployment::insert_many(&self.store, tenant, &rows).await {
            error!(id = %deployment.id, "failed to create device deployments: {err}");
            if let Err(cleanup) = Deployment::delete(&self.store, tenant, &deployment.id).await {
                error!(id = %deployment.id, "failed to remove deployment: {cleanup}");
            }
            return Err(err);
        }

        info!(id = %deployment.id, devices = rows.len(), "deployment created");
        Ok(deployment.id)
    }

    /// Applies a device's status report: the device deployment first, then
    /// the deployment counters, then the device's last known status. A
    /// repeated report reconciles the counters and rewrites the last status,
    /// so retrying a report whose later writes failed repairs them.
    #[tracing::instrument(skip(self))]
    pub async fn report_status(
        &self,
        tenant: Option<&TenantId>,
        device_id: &str,
        deployment_id: &str,
        report: StatusReport,
    ) -> Result<()> {
        report.validate()?;

        let current = device_deployment::find(&self.store, tenant, device_id, deployment_id)
            .await?
            .ok_or(Error::NotFound("device deployment"))?;
        match current.status {
            DeviceDeploymentStatus::Aborted => return Err(Error::DeploymentAborted),
            DeviceDeploymentStatus::Decommissioned => return Err(Error::DeviceDecommissioned),
            status if status == report.status && current.substate == report.substate => {
                stats::reconcile(&self.store, tenant, deployment_id).await?;
                return device_deployment::save_last_status(&self.store, tenant, &current).await;
            }
            _ => {}
        }

        let finished = report.status.is_terminal().then(Utc::now);
        let previous = device_deployment::apply_status(
            &self.store,
            tenant,
            device_id,
            deployment_id,
            report.status,
            report.substate.as_deref(),
            finished,
        )
        .await?;

        stats::transition_count(&self.store, tenant, deployment_id, previous, report.status)
            .await?;

        let updated = DeviceDeployment {
            status: report.status,
            substate: report.substate.clone().or(current.substate.clone()),
            finished: finished.or(current.finished),
            ..current
        };
        device_deployment::save_last_status(&self.store, tenant, &updated).await
    }

    /// Aborts every device still working on the deployment and recounts.
    #[tracing::instrument(skip(self))]
    pub async fn abort_deployment(
        &self,
        tenant: Option<&TenantId>,
        deployment_id: &str,
    ) -> Result<Stats> {
        let deployment = Deployment::find_by_id(&self.store, tenant, deployment_id)
            .await?
            .ok_or(Error::NotFound("deployment"))?;
        if deployment.is_finished() {
            return Err(Error::InvalidInput("deployment already finished".to_string()));
        }

        device_deployment::abort_all(&self.store, tenant, deployment_id).await?;
        stats::reconcile(&self.store, tenant, deployment_id).await
    }

    /// Decommissions the device in every deployment it still takes part in
    /// and recounts those deployments.
    #[tracing::instrument(skip(self))]
    pub async fn decommission_device(
        &self,
        tenant: Option<&TenantId>,
        device_id: &str,
    ) -> Result<Vec<String>> {
        let deployments = device_deployment::decommission_all(&self.store, tenant, device_id).await?;
        for deployment_id in &deployments {
            match stats::reconcile(&self.store, tenant, deployment_id).await {
                Ok(_) => {}
                Err(Error::InvalidId(_)) => {
                    warn!(device_id, deployment_id, "deployment vanished during decommission")
                }
                Err(err) => return Err(err),
            }
        }
        Ok(deployments)
    }

    pub async fn deployment(
        &self,
        tenant: Option<&TenantId>,
        deployment_id: &str,
    ) -> Result<Option<Deployment>> {
        Deployment::find_by_id(&self.store, tenant, deployment_id).await
    }

    /// Counters of the deployment; drifted counters are reconciled first.
    pub async fn deployment_stats(
        &self,
        tenant: Option<&TenantId>,
        deployment_id: &str,
    ) -> Result<Stats> {
        let stats = self
            .deployment(tenant, deployment_id)
            .await?
            .ok_or(Error::NotFound("deployment"))?
            .stats;
        let drifted = stats.drifted();
        if drifted.is_empty() {
            return Ok(stats);
        }
        warn!(deployment_id, ?drifted, "negative counters, reconciling");
        stats::reconcile(&self.store, tenant, deployment_id).await
    }

    pub async fn find_deployments(
        &self,
        tenant: Option<&TenantId>,
        query: &Query,
    ) -> Result<Vec<Deployment>> {
        Deployment::find(&self.store, tenant, query).await
    }

    pub async fn device_deployments(
        &self,
        tenant: Option<&TenantId>,
        deployment_id: &str,
    ) -> Result<Vec<DeviceDeployment>> {
        device_deployment::for_deployment(&self.store, tenant, deployment_id).await
    }

    pub async fn last_statuses(
        &self,
        tenant: Option<&TenantId>,
        device_ids: &[String],
    ) -> Result<Vec<LastStatus>> {
        device_deployment::last_status_per_device(&self.store, tenant, device_ids).await
    }

    pub async fn reconcile(&self, tenant: Option<&TenantId>, deployment_id: &str) -> Result<Stats> {
        stats::reconcile(&self.store, tenant, deployment_id).await
    }
}
