//! Deployment progress bookkeeping: per-device status transitions, the
//! deployment counters and classification derived from them, and the
//! versioned schema migrations for every tenant database.

pub mod app;
pub mod config;
pub mod db;
pub mod deployment;
pub mod device_deployment;
pub mod error;
pub mod migrations;
pub mod stats;
pub mod status;
pub mod store;
pub mod tenant;

pub use app::Deployments;
pub use config::Config;
pub use db::DataStore;
pub use error::{Error, Result};
pub use status::DeviceDeploymentStatus;
pub use tenant::TenantId;

/// Schema version this build writes and migrates to.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
