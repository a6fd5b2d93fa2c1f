use crate::store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("operation requires a tenant")]
    TenantRequired,
    #[error("schema conflict in '{database}': {source}")]
    SchemaConflict {
        database: String,
        #[source]
        source: StoreError,
    },
    #[error("store unavailable during {operation}")]
    StoreUnavailable {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("database '{database}' is at {current}, {target} required and automigration is disabled")]
    MigrationRequired {
        database: String,
        current: String,
        target: String,
    },
    #[error("migration {version} failed on '{database}'")]
    Migration {
        version: String,
        database: String,
        #[source]
        source: Box<Error>,
    },
    #[error("deployment was aborted")]
    DeploymentAborted,
    #[error("device was decommissioned")]
    DeviceDecommissioned,
    #[error("invalid version '{0}'")]
    InvalidVersion(String),
}

/// Wraps store failures with the name of the operation that hit them.
pub(crate) trait StoreContext<T> {
    fn during(self, operation: &'static str) -> Result<T>;
}

impl<T> StoreContext<T> for std::result::Result<T, StoreError> {
    fn during(self, operation: &'static str) -> Result<T> {
        self.map_err(|source| Error::StoreUnavailable { operation, source })
    }
}
