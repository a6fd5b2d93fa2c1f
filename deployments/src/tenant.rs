use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tenant identifier, passed explicitly to every tenant-scoped operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: &str) -> Result<Self> {
        let id = id.trim();
        if id.is_empty() {
            return Err(Error::InvalidId("tenant id is empty".to_string()));
        }
        if id.contains(['"', '\0']) {
            return Err(Error::InvalidId(format!("tenant id '{id}'")));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of the logical database holding `tenant`'s data.
pub fn db_name(base: &str, tenant: Option<&TenantId>) -> String {
    match tenant {
        Some(tenant) => format!("{base}-{tenant}"),
        None => base.to_string(),
    }
}

pub fn tenant_from_db(base: &str, db: &str) -> Option<TenantId> {
    db.strip_prefix(base)?
        .strip_prefix('-')
        .and_then(|id| TenantId::new(id).ok())
}

pub fn is_tenant_db(base: &str, db: &str) -> bool {
    tenant_from_db(base, db).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_names() {
        let tenant = TenantId::new("acme").unwrap();
        assert_eq!(db_name("deployment_service", None), "deployment_service");
        assert_eq!(db_name("deployment_service", Some(&tenant)), "deployment_service-acme");
        assert_eq!(
            tenant_from_db("deployment_service", "deployment_service-acme"),
            Some(tenant)
        );
        assert!(!is_tenant_db("deployment_service", "deployment_service"));
        assert!(!is_tenant_db("deployment_service", "deployment_service-"));
        assert!(!is_tenant_db("deployment_service", "other-acme"));
        assert!(TenantId::new("  ").is_err());
    }
}
