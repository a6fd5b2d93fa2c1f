use crate::db::timestamp;
use crate::status::DeviceDeploymentStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One device's participation in one deployment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceDeployment {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "deploymentid")]
    pub deployment_id: String,
    #[serde(rename = "deviceid")]
    pub device_id: String,
    pub status: DeviceDeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substate: Option<String>,
    #[serde(with = "timestamp")]
    pub created: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub finished: Option<DateTime<Utc>>,
    /// Set once the device uploaded a deployment log.
    #[serde(default)]
    pub log: bool,
    /// Artifact assigned to the device for this deployment.
    #[serde(default)]
    pub image: Option<Value>,
    #[serde(default)]
    pub active: bool,
}

impl DeviceDeployment {
    pub fn new(device_id: &str, deployment_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            deployment_id: deployment_id.to_string(),
            device_id: device_id.to_string(),
            status: DeviceDeploymentStatus::Pending,
            substate: None,
            created: Utc::now(),
            finished: None,
            log: false,
            image: None,
            active: true,
        }
    }
}

/// Most recent status reported by a device, across all its deployments.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LastStatus {
    #[serde(rename = "_id")]
    pub device_id: String,
    pub deployment_id: String,
    pub device_deployment_id: String,
    pub device_deployment_status: DeviceDeploymentStatus,
    pub tenant_id: String,
}
