use crate::db::timestamp;
use crate::deployment::query::{DeploymentStatus, classify};
use crate::error::{Error, Result};
use crate::stats::Stats;
use crate::status::DeviceDeploymentStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeploymentConstructor {
    pub name: String,
    #[serde(rename = "artifactname")]
    pub artifact_name: String,
    /// Target devices; consumed at creation and not stored.
    #[serde(default, skip_serializing)]
    pub devices: Vec<String>,
}

impl DeploymentConstructor {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("deployment name is empty".to_string()));
        }
        if self.artifact_name.trim().is_empty() {
            return Err(Error::InvalidInput("artifact name is empty".to_string()));
        }
        if self.devices.is_empty() {
            return Err(Error::InvalidInput("deployment has no devices".to_string()));
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.trim().is_empty() {
                return Err(Error::InvalidId("device id is empty".to_string()));
            }
            if !seen.insert(device) {
                return Err(Error::InvalidInput(format!("device '{device}' listed twice")));
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Deployment {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "deploymentconstructor")]
    pub constructor: DeploymentConstructor,
    #[serde(with = "timestamp")]
    pub created: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub finished: Option<DateTime<Utc>>,
    /// Ids of the artifacts matching the artifact name at creation.
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub stats: Stats,
    #[serde(default)]
    pub device_count: u64,
    pub status: DeploymentStatus,
    pub active: bool,
}

impl Deployment {
    pub fn new(constructor: DeploymentConstructor, artifacts: Vec<String>) -> Self {
        let device_count = constructor.devices.len() as u64;
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            constructor,
            created: Utc::now(),
            finished: None,
            artifacts,
            stats: Stats::new().with(DeviceDeploymentStatus::Pending, device_count as i64),
            device_count,
            status: DeploymentStatus::Pending,
            active: true,
        }
    }

    pub fn classify(&self) -> Option<DeploymentStatus> {
        classify(&self.stats, self.finished.is_some())
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SubsecRound;
    use serde_json::json;

    fn constructor(devices: &[&str]) -> DeploymentConstructor {
        DeploymentConstructor {
            name: "fleet".to_string(),
            artifact_name: "rootfs-v2".to_string(),
            devices: devices.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn constructor_validation() {
        assert!(constructor(&["a", "b"]).validate().is_ok());
        assert!(matches!(constructor(&[]).validate(), Err(Error::InvalidInput(_))));
        assert!(matches!(constructor(&["a", "a"]).validate(), Err(Error::InvalidInput(_))));
        assert!(matches!(constructor(&["a", " "]).validate(), Err(Error::InvalidId(_))));
    }

    #[test]
    fn new_deployment_is_pending_for_every_device() {
        let deployment = Deployment::new(constructor(&["a", "b", "c"]), vec![]);

        assert_eq!(deployment.stats.get(DeviceDeploymentStatus::Pending), 3);
        assert_eq!(deployment.classify(), Some(DeploymentStatus::Pending));

        let value = serde_json::to_value(&deployment).unwrap();
        assert_eq!(value["deploymentconstructor"], json!({"name": "fleet", "artifactname": "rootfs-v2"}));
        assert_eq!(value["status"], json!("pending"));
        assert_eq!(value["finished"], json!(null));
        assert_eq!(value["stats"]["pending"], json!(3));

        let decoded: Deployment = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.created, deployment.created.trunc_subsecs(6));
    }
}
