//! Kubernetes side of the operator: resource naming, the controllers the
//! reconcile phases drive, and their kube-backed implementations.

mod checker;
mod controls;
mod ensurer;
mod healer;
pub mod resources;

pub use checker::{check_node_count, KubeChecker};
pub use controls::KubeControls;
pub use ensurer::KubeEnsurer;
pub use healer::{stuck_terminating, KubeHealer};

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;

#[cfg(test)]
use mockall::automock;

use crate::crd::{DistributedRedisCluster, RedisClusterBackup};
use crate::error::Result;

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "redis-cluster-operator";

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Group a pod, PVC or PDB belongs to.
pub const LABEL_STATEFULSET: &str = "redis.kun/statefulset";

/// StatefulSet of group `ordinal`.
pub fn statefulset_name(cluster: &str, ordinal: usize) -> String {
    format!("drc-{}-{}", cluster, ordinal)
}

/// Headless service of group `ordinal`.
pub fn headless_service_name(cluster: &str, ordinal: usize) -> String {
    statefulset_name(cluster, ordinal)
}

/// PodDisruptionBudget of group `ordinal`.
pub fn pdb_name(cluster: &str, ordinal: usize) -> String {
    statefulset_name(cluster, ordinal)
}

pub fn config_map_name(cluster: &str) -> String {
    format!("redis-cluster-{}", cluster)
}

/// Object storage credentials copied from a backup when restoring.
pub fn osm_secret_name(cluster: &str) -> String {
    format!("osm-{}", cluster)
}

/// Group ordinal encoded in a StatefulSet name of `cluster`.
pub fn group_ordinal(cluster: &str, statefulset: &str) -> Option<usize> {
    statefulset
        .strip_prefix("drc-")?
        .strip_prefix(cluster)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

pub fn common_labels(cluster: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_NAME.to_string(), "redis-cluster".to_string());
    labels.insert(LABEL_INSTANCE.to_string(), cluster.to_string());
    labels.insert(LABEL_MANAGED_BY.to_string(), FIELD_MANAGER.to_string());
    labels
}

pub fn group_labels(cluster: &str, ordinal: usize) -> BTreeMap<String, String> {
    let mut labels = common_labels(cluster);
    labels.insert(
        LABEL_STATEFULSET.to_string(),
        statefulset_name(cluster, ordinal),
    );
    labels
}

/// `k=v,k=v` selector for list calls.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Creates or updates every resource a cluster runs on. All methods are idempotent.
#[async_trait]
pub trait Ensurer: Send + Sync {
    async fn ensure_config_map(&self, cluster: &DistributedRedisCluster) -> Result<()>;

    /// Ensure one StatefulSet and PodDisruptionBudget per group. Returns true
    /// if an existing StatefulSet had to be changed.
    async fn ensure_statefulsets(
        &self,
        cluster: &DistributedRedisCluster,
        backup: Option<&RedisClusterBackup>,
    ) -> Result<bool>;

    async fn ensure_headless_services(&self, cluster: &DistributedRedisCluster) -> Result<()>;

    async fn ensure_client_service(&self, cluster: &DistributedRedisCluster) -> Result<()>;

    /// Copy the backup's object storage credentials next to the cluster.
    async fn ensure_osm_secret(
        &self,
        cluster: &DistributedRedisCluster,
        backup: Option<&RedisClusterBackup>,
    ) -> Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatefulSetControl: Send + Sync {
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<StatefulSet>;

    async fn delete_statefulset(&self, namespace: &str, name: &str) -> Result<()>;

    /// StatefulSets of every group of `cluster`.
    async fn list_cluster_statefulsets(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<Vec<StatefulSet>>;

    /// Pods of one group, terminating ones included.
    async fn list_statefulset_pods(&self, namespace: &str, name: &str) -> Result<Vec<Pod>>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PdbControl: Send + Sync {
    async fn delete_pdb(&self, namespace: &str, name: &str) -> Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PvcControl: Send + Sync {
    async fn delete_pvcs_by_labels(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupControl: Send + Sync {
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<RedisClusterBackup>;
}

/// Repairs pods the platform does not recover on its own.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Healer: Send + Sync {
    /// Force-delete pods terminating for longer than `allowance`. Returns true
    /// if any pod was deleted.
    async fn fix_terminating_pods(
        &self,
        cluster: &DistributedRedisCluster,
        allowance: Duration,
    ) -> Result<bool>;
}

/// Verifies the cluster runs the expected number of nodes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Checker: Send + Sync {
    /// Fails with [`Error::NodeCount`](crate::error::Error::NodeCount) for the
    /// first group whose ready pods differ from `clusterReplicas + 1`.
    async fn check_redis_node_num(&self, cluster: &DistributedRedisCluster) -> Result<()>;
}
