//! Recovery of pods stuck terminating.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use kube::{Client, ResourceExt};
use tracing::{info, warn};

use super::{common_labels, label_selector, Healer};
use crate::crd::DistributedRedisCluster;
use crate::error::Result;

/// Names of pods whose deletion started more than `allowance` before `now`.
pub fn stuck_terminating(pods: &[Pod], now: DateTime<Utc>, allowance: Duration) -> Vec<String> {
    let allowance = chrono::Duration::from_std(allowance).unwrap_or_else(|_| chrono::Duration::weeks(5200));
    pods.iter()
        .filter(|pod| {
            pod.metadata
                .deletion_timestamp
                .as_ref()
                .map_or(false, |ts| now.signed_duration_since(ts.0) > allowance)
        })
        .map(|pod| pod.name_any())
        .collect()
}

/// [`Healer`] force-deleting pods through the API.
pub struct KubeHealer {
    client: Client,
}

impl KubeHealer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Healer for KubeHealer {
    async fn fix_terminating_pods(
        &self,
        cluster: &DistributedRedisCluster,
        allowance: Duration,
    ) -> Result<bool> {
        let namespace = cluster.namespace_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let lp = ListParams::default().labels(&label_selector(&common_labels(&cluster.name_any())));
        let pods = api.list(&lp).await?.items;

        let stuck = stuck_terminating(&pods, Utc::now(), allowance);
        let dp = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        for name in &stuck {
            warn!(pod = %name, "Pod stuck terminating, force deleting");
            api.delete(name, &dp).await?;
        }
        if !stuck.is_empty() {
            info!(count = stuck.len(), "Force deleted terminating pods");
        }
        Ok(!stuck.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn pod(name: &str, deleted_secs_ago: Option<i64>, now: DateTime<Utc>) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.deletion_timestamp =
            deleted_secs_ago.map(|s| Time(now - chrono::Duration::seconds(s)));
        pod
    }

    #[test]
    fn test_stuck_terminating() {
        let now = Utc::now();
        let pods = vec![
            pod("running", None, now),
            pod("recent", Some(60), now),
            pod("stuck", Some(600), now),
        ];
        let stuck = stuck_terminating(&pods, now, Duration::from_secs(300));
        assert_eq!(stuck, vec!["stuck".to_string()]);
    }
}
