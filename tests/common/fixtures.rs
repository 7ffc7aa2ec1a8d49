// Test fixtures: fake infrastructure and cluster builders

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use redis_cluster_operator::config::OperatorConfig;
use redis_cluster_operator::crd::{DistributedRedisCluster, RedisClusterBackup};
use redis_cluster_operator::error::{Error, Result};
use redis_cluster_operator::k8s::{
    group_labels, group_ordinal, BackupControl, Checker, Ensurer, Healer, PdbControl,
    PvcControl, ServiceControl, StatefulSetControl,
};
use redis_cluster_operator::sync::{Controls, PodEndpoint, SyncOrchestrator};

use super::fake_redis::{FakeRedis, CLUSTER};

/// Infrastructure that always converges and records every call.
#[derive(Default)]
pub struct FakeInfra {
    calls: Mutex<Vec<String>>,
}

impl FakeInfra {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Deletions received, e.g. `delete_statefulset drc-cache-4`.
    pub fn deletions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("delete_"))
            .collect()
    }
}

#[async_trait]
impl Ensurer for FakeInfra {
    async fn ensure_config_map(&self, cluster: &DistributedRedisCluster) -> Result<()> {
        self.record(format!("ensure_config_map {}", cluster.name_any()));
        Ok(())
    }

    async fn ensure_statefulsets(
        &self,
        cluster: &DistributedRedisCluster,
        _backup: Option<&RedisClusterBackup>,
    ) -> Result<bool> {
        self.record(format!("ensure_statefulsets {}", cluster.spec.master_size));
        Ok(false)
    }

    async fn ensure_headless_services(&self, _cluster: &DistributedRedisCluster) -> Result<()> {
        self.record("ensure_headless_services".to_string());
        Ok(())
    }

    async fn ensure_client_service(&self, _cluster: &DistributedRedisCluster) -> Result<()> {
        self.record("ensure_client_service".to_string());
        Ok(())
    }

    async fn ensure_osm_secret(
        &self,
        _cluster: &DistributedRedisCluster,
        _backup: Option<&RedisClusterBackup>,
    ) -> Result<()> {
        self.record("ensure_osm_secret".to_string());
        Ok(())
    }
}

#[async_trait]
impl StatefulSetControl for FakeInfra {
    async fn get_statefulset(&self, _namespace: &str, name: &str) -> Result<StatefulSet> {
        let ordinal = group_ordinal(CLUSTER, name)
            .ok_or_else(|| Error::NotFound(format!("statefulset {}", name)))?;
        let mut sts = StatefulSet::default();
        sts.metadata.name = Some(name.to_string());
        sts.metadata.labels = Some(group_labels(CLUSTER, ordinal));
        Ok(sts)
    }

    async fn delete_statefulset(&self, _namespace: &str, name: &str) -> Result<()> {
        self.record(format!("delete_statefulset {}", name));
        Ok(())
    }

    async fn list_cluster_statefulsets(
        &self,
        _namespace: &str,
        _cluster: &str,
    ) -> Result<Vec<StatefulSet>> {
        Ok(Vec::new())
    }

    async fn list_statefulset_pods(&self, _namespace: &str, _name: &str) -> Result<Vec<Pod>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl ServiceControl for FakeInfra {
    async fn delete_service(&self, _namespace: &str, name: &str) -> Result<()> {
        self.record(format!("delete_service {}", name));
        Ok(())
    }
}

#[async_trait]
impl PdbControl for FakeInfra {
    async fn delete_pdb(&self, _namespace: &str, name: &str) -> Result<()> {
        self.record(format!("delete_pdb {}", name));
        Ok(())
    }
}

#[async_trait]
impl PvcControl for FakeInfra {
    async fn delete_pvcs_by_labels(
        &self,
        _namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let group = labels
            .get(redis_cluster_operator::k8s::LABEL_STATEFULSET)
            .cloned()
            .unwrap_or_default();
        self.record(format!("delete_pvcs {}", group));
        Ok(())
    }
}

#[async_trait]
impl BackupControl for FakeInfra {
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<RedisClusterBackup> {
        self.record(format!("get_backup {}/{}", namespace, name));
        Err(Error::NotFound(format!("backup {}/{}", namespace, name)))
    }
}

#[async_trait]
impl Checker for FakeInfra {
    async fn check_redis_node_num(&self, _cluster: &DistributedRedisCluster) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Healer for FakeInfra {
    async fn fix_terminating_pods(
        &self,
        _cluster: &DistributedRedisCluster,
        _allowance: Duration,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// Orchestrator wired to `infra`, with no join settle delay.
pub fn orchestrator(infra: &Arc<FakeInfra>) -> SyncOrchestrator {
    let controls = Controls {
        ensurer: infra.clone(),
        statefulsets: infra.clone(),
        services: infra.clone(),
        pdbs: infra.clone(),
        pvcs: infra.clone(),
        backups: infra.clone(),
        checker: infra.clone(),
    };
    let config = OperatorConfig {
        join_settle_millis: 0,
        ..Default::default()
    };
    SyncOrchestrator::new(controls, config)
}

pub fn cluster(master_size: i32, replicas: i32) -> DistributedRedisCluster {
    let spec = serde_json::from_value(serde_json::json!({
        "masterSize": master_size,
        "clusterReplicas": replicas,
    }))
    .unwrap();
    let mut cluster = DistributedRedisCluster::new(CLUSTER, spec);
    cluster.metadata.namespace = Some("default".to_string());
    cluster
}

/// One endpoint per simulated node, as the pods would report them.
pub fn pods(fake: &FakeRedis) -> Vec<PodEndpoint> {
    fake.nodes()
        .into_iter()
        .map(|n| {
            let name = n.pod_name.clone().unwrap();
            let group = name.rsplit('-').nth(1).unwrap().parse().unwrap();
            PodEndpoint { name, ip: n.ip, group }
        })
        .collect()
}
