//! Thin get/list/delete wrappers over the Kubernetes API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, DeleteParams, ListParams};
use kube::Client;
use tracing::debug;

use super::{
    common_labels, label_selector, BackupControl, PdbControl, PvcControl, ServiceControl,
    StatefulSetControl, LABEL_STATEFULSET,
};
use crate::crd::RedisClusterBackup;
use crate::error::{Error, Result};

/// Kubernetes-backed implementation of the per-resource controls.
#[derive(Clone)]
pub struct KubeControls {
    client: Client,
}

impl KubeControls {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Treat "already gone" as success.
fn ignore_not_found<T>(res: std::result::Result<T, kube::Error>) -> Result<()> {
    match res {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl StatefulSetControl for KubeControls {
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<StatefulSet> {
        Ok(self.api::<StatefulSet>(namespace).get(name).await?)
    }

    async fn delete_statefulset(&self, namespace: &str, name: &str) -> Result<()> {
        debug!(namespace, statefulset = name, "Deleting StatefulSet");
        ignore_not_found(
            self.api::<StatefulSet>(namespace)
                .delete(name, &DeleteParams::foreground())
                .await,
        )
    }

    async fn list_cluster_statefulsets(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<Vec<StatefulSet>> {
        let lp = ListParams::default().labels(&label_selector(&common_labels(cluster)));
        Ok(self.api::<StatefulSet>(namespace).list(&lp).await?.items)
    }

    async fn list_statefulset_pods(&self, namespace: &str, name: &str) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(&format!("{}={}", LABEL_STATEFULSET, name));
        Ok(self.api::<Pod>(namespace).list(&lp).await?.items)
    }
}

#[async_trait]
impl ServiceControl for KubeControls {
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        debug!(namespace, service = name, "Deleting Service");
        ignore_not_found(
            self.api::<Service>(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )
    }
}

#[async_trait]
impl PdbControl for KubeControls {
    async fn delete_pdb(&self, namespace: &str, name: &str) -> Result<()> {
        debug!(namespace, pdb = name, "Deleting PodDisruptionBudget");
        ignore_not_found(
            self.api::<PodDisruptionBudget>(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )
    }
}

#[async_trait]
impl PvcControl for KubeControls {
    async fn delete_pvcs_by_labels(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        if labels.is_empty() {
            return Err(Error::validation("refusing to delete PVCs without a label selector"));
        }
        let lp = ListParams::default().labels(&label_selector(labels));
        debug!(namespace, selector = %label_selector(labels), "Deleting PVCs");
        self.api::<PersistentVolumeClaim>(namespace)
            .delete_collection(&DeleteParams::default(), &lp)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BackupControl for KubeControls {
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<RedisClusterBackup> {
        self.api::<RedisClusterBackup>(namespace)
            .get(name)
            .await
            .map_err(|source| Error::BackupUnavailable {
                name: format!("{}/{}", namespace, name),
                source,
            })
    }
}
