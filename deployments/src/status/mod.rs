use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod schema;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceDeploymentStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "downloading")]
    Downloading,
    #[serde(rename = "installing")]
    Installing,
    #[serde(rename = "rebooting")]
    Rebooting,
    #[serde(rename = "pause_before_installing")]
    PauseBeforeInstalling,
    #[serde(rename = "pause_before_committing")]
    PauseBeforeCommitting,
    #[serde(rename = "pause_before_rebooting")]
    PauseBeforeRebooting,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failure")]
    Failure,
    #[serde(rename = "noartifact")]
    NoArtifact,
    #[serde(rename = "already-installed")]
    AlreadyInstalled,
    #[serde(rename = "aborted")]
    Aborted,
    #[serde(rename = "decommissioned")]
    Decommissioned,
}

impl DeviceDeploymentStatus {
    pub const ALL: [DeviceDeploymentStatus; 13] = [
        Self::Pending,
        Self::Downloading,
        Self::Installing,
        Self::Rebooting,
        Self::PauseBeforeInstalling,
        Self::PauseBeforeCommitting,
        Self::PauseBeforeRebooting,
        Self::Success,
        Self::Failure,
        Self::NoArtifact,
        Self::AlreadyInstalled,
        Self::Aborted,
        Self::Decommissioned,
    ];

    pub const ACTIVE: [DeviceDeploymentStatus; 7] = [
        Self::Pending,
        Self::Downloading,
        Self::Installing,
        Self::Rebooting,
        Self::PauseBeforeInstalling,
        Self::PauseBeforeCommitting,
        Self::PauseBeforeRebooting,
    ];

    pub const TERMINAL: [DeviceDeploymentStatus; 6] = [
        Self::Success,
        Self::Failure,
        Self::NoArtifact,
        Self::AlreadyInstalled,
        Self::Aborted,
        Self::Decommissioned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Installing => "installing",
            Self::Rebooting => "rebooting",
            Self::PauseBeforeInstalling => "pause_before_installing",
            Self::PauseBeforeCommitting => "pause_before_committing",
            Self::PauseBeforeRebooting => "pause_before_rebooting",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::NoArtifact => "noartifact",
            Self::AlreadyInstalled => "already-installed",
            Self::Aborted => "aborted",
            Self::Decommissioned => "decommissioned",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn is_paused(&self) -> bool {
        matches!(
            self,
            Self::PauseBeforeInstalling | Self::PauseBeforeCommitting | Self::PauseBeforeRebooting
        )
    }

    /// Names of the active statuses, for use in filters.
    pub fn active_names() -> Vec<&'static str> {
        Self::ACTIVE.iter().map(Self::as_str).collect()
    }
}

impl fmt::Display for DeviceDeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceDeploymentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::InvalidInput("status name is empty".to_string()));
        }
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown status '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_and_terminal_partition_all_statuses() {
        for status in DeviceDeploymentStatus::ALL {
            assert_ne!(status.is_active(), status.is_terminal(), "{status}");
            assert_eq!(
                DeviceDeploymentStatus::TERMINAL.contains(&status),
                status.is_terminal()
            );
        }
        assert!(DeviceDeploymentStatus::PauseBeforeCommitting.is_active());
        assert!(DeviceDeploymentStatus::Decommissioned.is_terminal());
    }

    #[test]
    fn names_match_serde() {
        for status in DeviceDeploymentStatus::ALL {
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::json!(status.as_str())
            );
            assert_eq!(status.as_str().parse::<DeviceDeploymentStatus>().unwrap(), status);
        }
    }

    #[test]
    fn parse_rejects_unknown_names() {
        assert!(matches!(
            "".parse::<DeviceDeploymentStatus>(),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            "no-artifact".parse::<DeviceDeploymentStatus>(),
            Err(Error::InvalidInput(_))
        ));
    }
}
