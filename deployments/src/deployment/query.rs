//! Deployment classification. Each classification is available both as a
//! direct evaluation over a counter snapshot and as a [`Filter`] over stored
//! deployment documents; the two agree for every counter vector.

use crate::db::{KEY_ARTIFACT_NAME, KEY_CREATED, KEY_FINISHED, KEY_NAME, stats_key, timestamp};
use crate::stats::Stats;
use crate::status::DeviceDeploymentStatus::{self, *};
use crate::store::Filter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Counters whose presence alongside pending devices means the rollout has
/// started.
const STARTED_OUTCOMES: [DeviceDeploymentStatus; 4] = [AlreadyInstalled, Success, Failure, NoArtifact];

/// Counters that mark a device as being worked on.
const IN_FLIGHT: [DeviceDeploymentStatus; 6] = [
    Downloading,
    Installing,
    Rebooting,
    PauseBeforeInstalling,
    PauseBeforeCommitting,
    PauseBeforeRebooting,
];

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    #[serde(rename = "inprogress")]
    InProgress,
    Finished,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "inprogress",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StatusQuery {
    #[default]
    Any,
    Pending,
    #[serde(rename = "inprogress")]
    InProgress,
    Finished,
}

fn counting(status: DeviceDeploymentStatus) -> Filter {
    Filter::gt(&stats_key(status.as_str()), 0)
}

// Counters absent from the stored document read as zero.
fn zero(status: DeviceDeploymentStatus) -> Filter {
    let key = stats_key(status.as_str());
    Filter::or(vec![Filter::eq(&key, 0), Filter::exists(&key, false)])
}

fn in_progress_counters() -> Filter {
    let mut terms: Vec<Filter> = IN_FLIGHT.into_iter().map(counting).collect();
    terms.push(Filter::and(vec![
        counting(Pending),
        Filter::or(STARTED_OUTCOMES.into_iter().map(counting).collect()),
    ]));
    Filter::or(terms)
}

fn pending_counters() -> Filter {
    let mut terms: Vec<Filter> = DeviceDeploymentStatus::ALL
        .into_iter()
        .filter(|status| *status != Pending)
        .map(zero)
        .collect();
    terms.push(counting(Pending));
    Filter::and(terms)
}

pub fn finished_filter() -> Filter {
    Filter::not_null(KEY_FINISHED)
}

fn unfinished() -> Filter {
    Filter::eq(KEY_FINISHED, Value::Null)
}

pub fn in_progress_filter() -> Filter {
    Filter::and(vec![unfinished(), in_progress_counters()])
}

pub fn pending_filter() -> Filter {
    Filter::and(vec![unfinished(), pending_counters()])
}

pub fn is_in_progress(stats: &Stats) -> bool {
    IN_FLIGHT.iter().any(|status| stats.get(*status) > 0)
        || (stats.get(Pending) > 0 && STARTED_OUTCOMES.iter().any(|status| stats.get(*status) > 0))
}

pub fn is_pending(stats: &Stats) -> bool {
    stats.get(Pending) > 0
        && DeviceDeploymentStatus::ALL
            .iter()
            .filter(|status| **status != Pending)
            .all(|status| stats.get(*status) == 0)
}

/// Classification of a counter snapshot; `None` for vectors that are
/// neither pending nor in progress and not yet marked finished.
pub fn classify(stats: &Stats, finished: bool) -> Option<DeploymentStatus> {
    if finished {
        Some(DeploymentStatus::Finished)
    } else if is_in_progress(stats) {
        Some(DeploymentStatus::InProgress)
    } else if is_pending(stats) {
        Some(DeploymentStatus::Pending)
    } else {
        None
    }
}

impl StatusQuery {
    pub fn filter(&self) -> Filter {
        match self {
            Self::Any => Filter::All,
            Self::Pending => pending_filter(),
            Self::InProgress => in_progress_filter(),
            Self::Finished => finished_filter(),
        }
    }

    pub fn matches(&self, stats: &Stats, finished: bool) -> bool {
        let status = classify(stats, finished);
        match self {
            Self::Any => true,
            Self::Pending => status == Some(DeploymentStatus::Pending),
            Self::InProgress => status == Some(DeploymentStatus::InProgress),
            Self::Finished => status == Some(DeploymentStatus::Finished),
        }
    }
}

/// Deployment lookup.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Case-insensitive substring of the deployment or artifact name.
    #[serde(default)]
    pub search_text: Option<String>,
    #[serde(default)]
    pub status: StatusQuery,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub skip: u64,
    #[serde(default)]
    pub limit: Option<u64>,
}

impl Query {
    pub fn filter(&self) -> Filter {
        let mut terms = Vec::new();
        if let Some(text) = self.search_text.as_deref().filter(|text| !text.is_empty()) {
            terms.push(Filter::or(vec![
                Filter::contains(KEY_NAME, text),
                Filter::contains(KEY_ARTIFACT_NAME, text),
            ]));
        }
        if self.status != StatusQuery::Any {
            terms.push(self.status.filter());
        }
        if let Some(after) = &self.created_after {
            terms.push(Filter::gte(KEY_CREATED, timestamp::value(after)));
        }
        if let Some(before) = &self.created_before {
            terms.push(Filter::lte(KEY_CREATED, timestamp::value(before)));
        }
        match terms.len() {
            0 => Filter::All,
            1 => terms.remove(0),
            _ => Filter::and(terms),
        }
    }
}
