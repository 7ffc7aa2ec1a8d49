//! Node count verification.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;

use super::{statefulset_name, Checker, StatefulSetControl};
use crate::crd::DistributedRedisCluster;
use crate::error::{Error, Result};

/// Every group below `master_size` must have `replicas + 1` ready pods.
pub fn check_node_count(
    cluster: &str,
    statefulsets: &[StatefulSet],
    master_size: i32,
    replicas: i32,
) -> Result<()> {
    let expected = replicas + 1;
    for ordinal in 0..master_size.max(0) as usize {
        let name = statefulset_name(cluster, ordinal);
        let found = statefulsets
            .iter()
            .find(|s| s.name_any() == name)
            .and_then(|s| s.status.as_ref())
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        if found != expected {
            return Err(Error::NodeCount {
                group: name,
                expected,
                found,
            });
        }
    }
    Ok(())
}

/// [`Checker`] reading readiness from the group StatefulSets.
pub struct KubeChecker {
    statefulsets: Arc<dyn StatefulSetControl>,
}

impl KubeChecker {
    pub fn new(statefulsets: Arc<dyn StatefulSetControl>) -> Self {
        Self { statefulsets }
    }
}

#[async_trait]
impl Checker for KubeChecker {
    async fn check_redis_node_num(&self, cluster: &DistributedRedisCluster) -> Result<()> {
        let name = cluster.name_any();
        let sets = self
            .statefulsets
            .list_cluster_statefulsets(&cluster.namespace_or_default(), &name)
            .await?;
        check_node_count(
            &name,
            &sets,
            cluster.spec.master_size,
            cluster.spec.cluster_replicas,
        )
    }
}
