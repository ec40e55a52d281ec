use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use policy_engine::Deployment;

use crate::pipeline::DeploymentStore;

/// Deployments held in memory, keyed by ID.
#[derive(Debug, Default)]
pub struct InMemoryDeploymentStore {
    deployments: RwLock<HashMap<String, Deployment>>,
}

impl InMemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a deployment.
    pub fn insert(&self, deployment: Deployment) {
        self.deployments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(deployment.id.clone(), deployment);
    }

    pub fn remove(&self, id: &str) -> Option<Deployment> {
        self.deployments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Every stored deployment ID, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<Deployment> for InMemoryDeploymentStore {
    fn from_iter<I: IntoIterator<Item = Deployment>>(iter: I) -> Self {
        let store = Self::new();
        for deployment in iter {
            store.insert(deployment);
        }
        store
    }
}

#[async_trait]
impl DeploymentStore for InMemoryDeploymentStore {
    async fn get_deployment(&self, id: &str) -> anyhow::Result<Option<Deployment>> {
        Ok(self
            .deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    async fn cluster_deployments(&self, cluster_id: &str) -> anyhow::Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|d| d.cluster_id == cluster_id)
            .map(|d| d.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(id: &str, cluster: &str) -> Deployment {
        Deployment {
            id: id.into(),
            name: id.into(),
            cluster_id: cluster.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn lookup_and_cluster_search() {
        let store: InMemoryDeploymentStore = [
            deployment("b", "c1"),
            deployment("a", "c1"),
            deployment("z", "c2"),
        ]
        .into_iter()
        .collect();

        assert_eq!(store.len(), 3);
        assert_eq!(store.ids(), vec!["a", "b", "z"]);
        assert_eq!(store.get_deployment("z").await.unwrap().unwrap().cluster_id, "c2");
        assert!(store.get_deployment("missing").await.unwrap().is_none());
        assert_eq!(store.cluster_deployments("c1").await.unwrap(), vec!["a", "b"]);

        store.remove("a");
        assert_eq!(store.cluster_deployments("c1").await.unwrap(), vec!["b"]);
    }
}
