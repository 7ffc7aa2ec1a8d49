//! Create-or-update of the resources a cluster runs on.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::resources;
use super::{common_labels, osm_secret_name, Ensurer, FIELD_MANAGER};
use crate::crd::{DistributedRedisCluster, RedisClusterBackup};
use crate::error::{Error, Result};

/// [`Ensurer`] applying manifests with server-side apply.
pub struct KubeEnsurer {
    client: Client,
}

impl KubeEnsurer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn apply<K>(&self, namespace: &str, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
        K::DynamicType: Default,
    {
        let name = obj.meta().name.clone().unwrap_or_default();
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api.patch(&name, &pp, &Patch::Apply(obj)).await?;
        debug!(kind = %K::kind(&K::DynamicType::default()), name = %name, "Applied");
        Ok(applied)
    }
}

#[async_trait]
impl Ensurer for KubeEnsurer {
    async fn ensure_config_map(&self, cluster: &DistributedRedisCluster) -> Result<()> {
        let cm: ConfigMap = resources::config_map(cluster);
        self.apply(&cluster.namespace_or_default(), &cm).await?;
        Ok(())
    }

    async fn ensure_statefulsets(
        &self,
        cluster: &DistributedRedisCluster,
        backup: Option<&RedisClusterBackup>,
    ) -> Result<bool> {
        let namespace = cluster.namespace_or_default();
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
        let mut updated = false;

        for ordinal in 0..cluster.spec.master_size.max(0) as usize {
            let desired = resources::statefulset(cluster, ordinal, backup);
            let name = desired.name_any();
            if let Some(existing) = api.get_opt(&name).await? {
                if resources::statefulset_changed(&existing, &desired) {
                    info!(statefulset = %name, "Updating StatefulSet");
                    updated = true;
                }
            } else {
                info!(statefulset = %name, "Creating StatefulSet");
            }
            self.apply(&namespace, &desired).await?;

            let pdb: PodDisruptionBudget = resources::pod_disruption_budget(cluster, ordinal);
            self.apply(&namespace, &pdb).await?;
        }
        Ok(updated)
    }

    async fn ensure_headless_services(&self, cluster: &DistributedRedisCluster) -> Result<()> {
        let namespace = cluster.namespace_or_default();
        for ordinal in 0..cluster.spec.master_size.max(0) as usize {
            let svc: Service = resources::headless_service(cluster, ordinal);
            self.apply(&namespace, &svc).await?;
        }
        Ok(())
    }

    async fn ensure_client_service(&self, cluster: &DistributedRedisCluster) -> Result<()> {
        let svc = resources::client_service(cluster);
        self.apply(&cluster.namespace_or_default(), &svc).await?;
        Ok(())
    }

    async fn ensure_osm_secret(
        &self,
        cluster: &DistributedRedisCluster,
        backup: Option<&RedisClusterBackup>,
    ) -> Result<()> {
        let Some(backup) = backup else {
            return Ok(());
        };
        let Some(source_name) = &backup.spec.storage_secret_name else {
            return Ok(());
        };
        let source_ns = backup
            .namespace()
            .unwrap_or_else(|| cluster.namespace_or_default());
        let source: Secret = Api::namespaced(self.client.clone(), &source_ns)
            .get_opt(source_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("secret {}/{}", source_ns, source_name)))?;

        let name = cluster.name_any();
        let copy = Secret {
            metadata: ObjectMeta {
                name: Some(osm_secret_name(&name)),
                namespace: Some(cluster.namespace_or_default()),
                labels: Some(common_labels(&name)),
                owner_references: cluster.controller_owner_ref(&()).map(|r| vec![r]),
                ..Default::default()
            },
            data: source.data,
            type_: source.type_,
            ..Default::default()
        };
        self.apply(&cluster.namespace_or_default(), &copy).await?;
        Ok(())
    }
}
