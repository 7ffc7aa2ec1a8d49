//! Infrastructure convergence conditions.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;

use crate::error::Result;
use crate::k8s::{statefulset_name, StatefulSetControl};
use crate::wait::WaitHandle;

/// Every group StatefulSet has rolled out its latest spec and all its pods are ready.
pub struct WaitStatefulSetUpdating<'a> {
    pub statefulsets: &'a dyn StatefulSetControl,
    pub namespace: String,
    pub cluster: String,
    pub master_size: usize,
    pub tick: Duration,
    pub timeout: Duration,
}

/// Whether `sts` runs its current generation with every replica updated and ready.
pub fn statefulset_rolled_out(sts: &StatefulSet) -> bool {
    let (Some(spec), Some(status)) = (sts.spec.as_ref(), sts.status.as_ref()) else {
        return false;
    };
    let desired = spec.replicas.unwrap_or(1);
    let observed = status.observed_generation.unwrap_or(0) >= sts.metadata.generation.unwrap_or(0);
    let revision_settled = match (&status.current_revision, &status.update_revision) {
        (Some(current), Some(update)) => current == update,
        _ => true,
    };
    observed
        && revision_settled
        && status.updated_replicas.unwrap_or(0) == desired
        && status.ready_replicas.unwrap_or(0) == desired
}

#[async_trait]
impl WaitHandle for WaitStatefulSetUpdating<'_> {
    fn name(&self) -> &str {
        "WaitStatefulSetUpdating"
    }

    fn tick(&self) -> Duration {
        self.tick
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn check(&self) -> Result<bool> {
        let sets = self
            .statefulsets
            .list_cluster_statefulsets(&self.namespace, &self.cluster)
            .await?;
        Ok((0..self.master_size).all(|ordinal| {
            let name = statefulset_name(&self.cluster, ordinal);
            sets.iter()
                .find(|s| s.name_any() == name)
                .map_or(false, statefulset_rolled_out)
        }))
    }
}

/// No pod of a deleted group is left.
pub struct WaitPodTerminating<'a> {
    pub statefulsets: &'a dyn StatefulSetControl,
    pub namespace: String,
    pub statefulset: String,
    pub tick: Duration,
    pub timeout: Duration,
}

#[async_trait]
impl WaitHandle for WaitPodTerminating<'_> {
    fn name(&self) -> &str {
        "WaitPodTerminating"
    }

    fn tick(&self) -> Duration {
        self.tick
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn check(&self) -> Result<bool> {
        let pods = self
            .statefulsets
            .list_statefulset_pods(&self.namespace, &self.statefulset)
            .await?;
        Ok(pods.is_empty())
    }
}
