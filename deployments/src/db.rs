use crate::config::DEFAULT_DB_NAME;
use crate::store::{Client, Database};
use crate::tenant::{TenantId, db_name};
use std::sync::Arc;

pub const COLLECTION_DEPLOYMENTS: &str = "deployments";
pub const COLLECTION_DEVICES: &str = "devices";
pub const COLLECTION_DEVICE_LOGS: &str = "devices_logs";
pub const COLLECTION_DEVICES_LAST_STATUS: &str = "devices_last_status";
pub const COLLECTION_IMAGES: &str = "images";
pub const COLLECTION_RELEASES: &str = "releases";
pub const COLLECTION_MIGRATIONS: &str = "migration_info";

pub const KEY_ID: &str = "_id";
pub const KEY_NAME: &str = "deploymentconstructor.name";
pub const KEY_ARTIFACT_NAME: &str = "deploymentconstructor.artifactname";
pub const KEY_STATS: &str = "stats";
pub const KEY_STATUS: &str = "status";
pub const KEY_ACTIVE: &str = "active";
pub const KEY_CREATED: &str = "created";
pub const KEY_FINISHED: &str = "finished";
pub const KEY_DEVICE_ID: &str = "deviceid";
pub const KEY_DEPLOYMENT_ID: &str = "deploymentid";
pub const KEY_SUBSTATE: &str = "substate";
pub const KEY_LOG: &str = "log";
pub const KEY_IMAGE: &str = "image";
pub const KEY_IMAGE_NAME: &str = "meta_artifact.name";
pub const KEY_RELEASE_NAME: &str = "name";
pub const KEY_RELEASE_ARTIFACTS: &str = "artifacts";
pub const KEY_RELEASE_ARTIFACTS_COUNT: &str = "artifacts_count";
pub const KEY_RELEASE_MODIFIED: &str = "modified";

/// Entry point to the logical databases: the default one and one per tenant.
#[derive(Debug, Clone)]
pub struct DataStore {
    client: Arc<dyn Client>,
    db_name: String,
}

impl DataStore {
    pub fn new(client: Arc<dyn Client>, db_name: &str) -> Self {
        Self {
            client,
            db_name: db_name.to_string(),
        }
    }

    pub fn with_default_name(client: Arc<dyn Client>) -> Self {
        Self::new(client, DEFAULT_DB_NAME)
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn database(&self, tenant: Option<&TenantId>) -> Arc<dyn Database> {
        self.client.database(&db_name(&self.db_name, tenant))
    }

    pub fn default_database(&self) -> Arc<dyn Database> {
        self.client.database(&self.db_name)
    }
}

pub(crate) fn stats_key(status: &str) -> String {
    format!("{KEY_STATS}.{status}")
}

/// Timestamps are stored as fixed-width RFC 3339 strings in UTC so that
/// string comparison and sorting follow time order.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn format(at: &DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn value(at: &DateTime<Utc>) -> Value {
        Value::String(format(at))
    }

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        DateTime::<Utc>::deserialize(deserializer)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            at: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match at {
                Some(at) => serializer.serialize_str(&super::format(at)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<DateTime<Utc>>::deserialize(deserializer)
        }
    }
}
