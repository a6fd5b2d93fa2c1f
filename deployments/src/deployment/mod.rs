use crate::db::{COLLECTION_DEPLOYMENTS, DataStore, KEY_CREATED, KEY_ID};
use crate::error::{Error, Result, StoreContext};
use crate::store::{Document, Filter, FindOptions, SortOrder, StoreError};
use crate::tenant::TenantId;

pub mod query;
pub mod schema;

pub use query::{DeploymentStatus, Query, StatusQuery};
pub use schema::{Deployment, DeploymentConstructor};

fn decode(doc: Document) -> Result<Deployment> {
    serde_json::from_value(serde_json::Value::Object(doc))
        .map_err(|err| Error::StoreUnavailable {
            operation: "decode deployment",
            source: StoreError::Malformed(err),
        })
}

fn encode(deployment: &Deployment) -> Result<Document> {
    match serde_json::to_value(deployment) {
        Ok(serde_json::Value::Object(doc)) => Ok(doc),
        Ok(_) => Err(Error::InvalidInput("deployment is not an object".to_string())),
        Err(err) => Err(Error::StoreUnavailable {
            operation: "encode deployment",
            source: StoreError::Malformed(err),
        }),
    }
}

impl Deployment {
    #[tracing::instrument(skip(self, store), fields(id = %self.id))]
    pub async fn insert(&self, store: &DataStore, tenant: Option<&TenantId>) -> Result<()> {
        store
            .database(tenant)
            .insert_many(COLLECTION_DEPLOYMENTS, vec![encode(self)?])
            .await
            .during("insert deployment")
    }

    pub async fn find_by_id(
        store: &DataStore,
        tenant: Option<&TenantId>,
        id: &str,
    ) -> Result<Option<Self>> {
        if id.trim().is_empty() {
            return Err(Error::InvalidId("deployment id is empty".to_string()));
        }
        store
            .database(tenant)
            .find_one(COLLECTION_DEPLOYMENTS, &Filter::eq(KEY_ID, id))
            .await
            .during("find deployment")?
            .map(decode)
            .transpose()
    }

    /// Deployments matching `query`, newest first.
    #[tracing::instrument(skip(store))]
    pub async fn find(
        store: &DataStore,
        tenant: Option<&TenantId>,
        query: &Query,
    ) -> Result<Vec<Self>> {
        let options = FindOptions {
            skip: query.skip,
            limit: query.limit,
            ..FindOptions::sorted(KEY_CREATED, SortOrder::Desc)
        };
        store
            .database(tenant)
            .find(COLLECTION_DEPLOYMENTS, &query.filter(), &options)
            .await
            .during("find deployments")?
            .into_iter()
            .map(decode)
            .collect()
    }

    pub async fn delete(store: &DataStore, tenant: Option<&TenantId>, id: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(Error::InvalidId("deployment id is empty".to_string()));
        }
        let deleted = store
            .database(tenant)
            .delete_one(COLLECTION_DEPLOYMENTS, &Filter::eq(KEY_ID, id))
            .await
            .during("delete deployment")?;
        if deleted == 0 {
            return Err(Error::NotFound("deployment"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryClient;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn constructor(name: &str, devices: usize) -> DeploymentConstructor {
        DeploymentConstructor {
            name: name.to_string(),
            artifact_name: format!("{name}-artifact"),
            devices: (0..devices).map(|i| format!("device-{i}")).collect(),
        }
    }

    #[tokio::test]
    async fn insert_find_and_delete() {
        let store = DataStore::with_default_name(Arc::new(MemoryClient::new()));
        let deployment = Deployment::new(constructor("fleet", 2), vec!["a1".to_string()]);
        deployment.insert(&store, None).await.unwrap();

        let found = Deployment::find_by_id(&store, None, &deployment.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, deployment.id);
        assert_eq!(found.artifacts, vec!["a1".to_string()]);
        assert_eq!(found.device_count, 2);

        Deployment::delete(&store, None, &deployment.id).await.unwrap();
        assert!(Deployment::find_by_id(&store, None, &deployment.id).await.unwrap().is_none());
        assert!(matches!(
            Deployment::delete(&store, None, &deployment.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn search_by_text_status_and_page() {
        let store = DataStore::with_default_name(Arc::new(MemoryClient::new()));
        let mut older = Deployment::new(constructor("Kitchen Sensors", 1), vec![]);
        older.created = Utc::now() - Duration::hours(2);
        older.insert(&store, None).await.unwrap();
        let newer = Deployment::new(constructor("kitchen lights", 1), vec![]);
        newer.insert(&store, None).await.unwrap();
        let mut done = Deployment::new(constructor("garage", 1), vec![]);
        done.finished = Some(Utc::now());
        done.status = DeploymentStatus::Finished;
        done.insert(&store, None).await.unwrap();

        let kitchen = Query {
            search_text: Some("KITCHEN".to_string()),
            ..Default::default()
        };
        let found = Deployment::find(&store, None, &kitchen).await.unwrap();
        assert_eq!(
            found.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            vec![newer.id.as_str(), older.id.as_str()]
        );

        let paged = Query {
            skip: 1,
            limit: Some(1),
            ..kitchen
        };
        assert_eq!(Deployment::find(&store, None, &paged).await.unwrap()[0].id, older.id);

        let finished = Query {
            status: StatusQuery::Finished,
            ..Default::default()
        };
        let found = Deployment::find(&store, None, &finished).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, done.id);

        let pending = Query {
            status: StatusQuery::Pending,
            ..Default::default()
        };
        assert_eq!(Deployment::find(&store, None, &pending).await.unwrap().len(), 2);
    }
}
