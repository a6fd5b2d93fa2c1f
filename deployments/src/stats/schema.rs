use crate::status::DeviceDeploymentStatus;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Per-status device counts of one deployment. Every known status has an
/// entry, zero included. Counts are signed: a counter decremented twice by
/// racing reports reads back negative until the deployment is reconciled.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct Stats(BTreeMap<DeviceDeploymentStatus, i64>);

impl Default for Stats {
    fn default() -> Self {
        Self(
            DeviceDeploymentStatus::ALL
                .into_iter()
                .map(|status| (status, 0))
                .collect(),
        )
    }
}

// Counters missing from a stored document read as zero; unknown names are
// ignored. Negative counts are kept as stored.
impl<'de> Deserialize<'de> for Stats {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, i64>::deserialize(deserializer)?;
        let mut stats = Stats::default();
        for (name, count) in raw {
            if let Ok(status) = name.parse() {
                stats.set(status, count);
            }
        }
        Ok(stats)
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, status: DeviceDeploymentStatus, count: i64) -> Self {
        self.set(status, count);
        self
    }

    pub fn get(&self, status: DeviceDeploymentStatus) -> i64 {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn set(&mut self, status: DeviceDeploymentStatus, count: i64) {
        self.0.insert(status, count);
    }

    pub fn increment(&mut self, status: DeviceDeploymentStatus, by: i64) {
        *self.0.entry(status).or_insert(0) += by;
    }

    pub fn total(&self) -> i64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceDeploymentStatus, i64)> + '_ {
        self.0.iter().map(|(status, count)| (*status, *count))
    }

    /// True when no active counter is positive and some terminal one is.
    pub fn all_terminal(&self) -> bool {
        DeviceDeploymentStatus::ACTIVE
            .iter()
            .all(|status| self.get(*status) <= 0)
            && DeviceDeploymentStatus::TERMINAL
                .iter()
                .any(|status| self.get(*status) > 0)
    }

    /// Counters driven below zero by reports that raced each other.
    pub fn drifted(&self) -> Vec<DeviceDeploymentStatus> {
        self.iter()
            .filter(|(_, count)| *count < 0)
            .map(|(status, _)| status)
            .collect()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.iter()
                .map(|(status, count)| (status.as_str().to_string(), Value::from(count)))
                .collect::<Map<String, Value>>(),
        )
    }
}
