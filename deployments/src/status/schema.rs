use crate::error::{Error, Result};
use crate::status::DeviceDeploymentStatus;
use serde::{Deserialize, Serialize};

pub const MAX_SUBSTATE_LEN: usize = 200;

/// Status update as reported by a device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: DeviceDeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substate: Option<String>,
}

impl StatusReport {
    pub fn new(status: DeviceDeploymentStatus) -> Self {
        Self {
            status,
            substate: None,
        }
    }

    pub fn with_substate(mut self, substate: &str) -> Self {
        self.substate = Some(substate.to_string());
        self
    }

    /// Devices may only report progress and their own outcome; pending,
    /// noartifact, aborted and decommissioned are set by the server.
    pub fn validate(&self) -> Result<()> {
        use DeviceDeploymentStatus::*;

        match self.status {
            Downloading | Installing | Rebooting | PauseBeforeInstalling
            | PauseBeforeCommitting | PauseBeforeRebooting | Success | Failure
            | AlreadyInstalled => {}
            other => {
                return Err(Error::InvalidInput(format!(
                    "status '{other}' cannot be reported by a device"
                )));
            }
        }
        if let Some(substate) = &self.substate {
            if substate.chars().count() > MAX_SUBSTATE_LEN {
                return Err(Error::InvalidInput(format!(
                    "substate exceeds {MAX_SUBSTATE_LEN} characters"
                )));
            }
        }
        Ok(())
    }
}
