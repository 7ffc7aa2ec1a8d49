//! The reconcile phase sequence.
//!
//! One tick runs `ensure_cluster → wait_pod_ready → wait_for_cluster_join →
//! sync_cluster`, stopping at the first failing phase. Every failure comes back
//! as a [`SyncError`] tagged with the step that produced it; nothing is rolled
//! back, the next tick simply runs all phases again.

mod cluster;
mod waiters;

pub use cluster::SyncAction;
pub use waiters::{statefulset_rolled_out, WaitPodTerminating, WaitStatefulSetUpdating};

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::config::OperatorConfig;
use crate::crd::{BackupPhase, DistributedRedisCluster, RedisClusterBackup};
use crate::error::{Error, ErrorKind, RedisError, Result, SyncResult};
use crate::k8s::{
    group_ordinal, BackupControl, Checker, Ensurer, Healer, PdbControl, PvcControl,
    ServiceControl, StatefulSetControl, LABEL_STATEFULSET,
};
use crate::redisutil::{Admin, ClusterInfos, Nodes};
use crate::wait::wait_until;

/// A running pod of the cluster and the group it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEndpoint {
    pub name: String,
    pub ip: String,
    pub group: usize,
}

impl PodEndpoint {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, crate::k8s::resources::REDIS_PORT)
    }
}

/// Pods of `cluster` that have an address and are not being deleted.
pub fn pod_endpoints(cluster: &str, pods: &[Pod]) -> Vec<PodEndpoint> {
    let mut endpoints: Vec<PodEndpoint> = pods
        .iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .filter_map(|p| {
            let ip = p.status.as_ref()?.pod_ip.clone()?;
            let group = group_ordinal(cluster, p.labels().get(LABEL_STATEFULSET)?)?;
            Some(PodEndpoint {
                name: p.name_any(),
                ip,
                group,
            })
        })
        .collect();
    endpoints.sort_by(|a, b| a.name.cmp(&b.name));
    endpoints
}

/// Match the snapshot's nodes to pods by address and group them by ordinal.
pub fn group_nodes(infos: &ClusterInfos, pods: &[PodEndpoint]) -> BTreeMap<usize, Nodes> {
    let mut groups: BTreeMap<usize, Nodes> = BTreeMap::new();
    for pod in pods {
        if let Some(node) = infos.node_by_ip(&pod.ip) {
            let mut node = node.clone();
            node.pod_name = Some(pod.name.clone());
            groups.entry(pod.group).or_default().push(node);
        } else {
            debug!(pod = %pod.name, "Pod not part of the snapshot");
        }
    }
    groups
}

/// State of one reconcile tick, passed through the phases.
pub struct SyncContext<'a> {
    /// Working copy of the resource; validation may rewrite its spec.
    pub cluster: DistributedRedisCluster,
    /// Latest snapshot; refreshed by the phases that change the topology.
    pub cluster_infos: ClusterInfos,
    pub admin: &'a dyn Admin,
    pub healer: &'a dyn Healer,
    pub pods: Vec<PodEndpoint>,
}

/// Infrastructure collaborators of the orchestrator.
#[derive(Clone)]
pub struct Controls {
    pub ensurer: Arc<dyn Ensurer>,
    pub statefulsets: Arc<dyn StatefulSetControl>,
    pub services: Arc<dyn ServiceControl>,
    pub pdbs: Arc<dyn PdbControl>,
    pub pvcs: Arc<dyn PvcControl>,
    pub backups: Arc<dyn BackupControl>,
    pub checker: Arc<dyn Checker>,
}

/// Drives a cluster through the reconcile phases.
pub struct SyncOrchestrator {
    controls: Controls,
    config: OperatorConfig,
}

impl SyncOrchestrator {
    pub fn new(controls: Controls, config: OperatorConfig) -> Self {
        Self { controls, config }
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Run every phase of one tick. On success `ctx.cluster_infos` holds the
    /// snapshot taken after the topology was synced.
    pub async fn run(&self, ctx: &mut SyncContext<'_>) -> SyncResult<SyncAction> {
        self.ensure_cluster(&mut ctx.cluster).await?;
        self.wait_pod_ready(&ctx.cluster, ctx.healer).await?;

        ctx.cluster_infos = ctx
            .admin
            .cluster_infos()
            .await
            .map_err(|e| ErrorKind::Requeue.wrap(e, "GetClusterInfos"))?;
        self.wait_for_cluster_join(ctx.admin, &ctx.cluster_infos).await?;

        let infos = ctx
            .admin
            .cluster_infos()
            .await
            .map_err(|e| ErrorKind::Requeue.wrap(e, "GetClusterInfos"))?;
        infos
            .ensure_consistent()
            .map_err(|e| ErrorKind::Requeue.wrap(e, "ClusterInfosConsistent"))?;
        ctx.cluster_infos = infos;

        let groups = group_nodes(&ctx.cluster_infos, &ctx.pods);
        let action = self
            .sync_cluster(&ctx.cluster, ctx.admin, &ctx.cluster_infos, &groups)
            .await?;

        if action != SyncAction::None {
            if let Ok(infos) = ctx.admin.cluster_infos().await {
                ctx.cluster_infos = infos;
            }
        }
        Ok(action)
    }

    /// Resolve the backup a cluster restores from and normalise the spec.
    ///
    /// When restoring, image (if unset), master count and replica count come
    /// from the backup. Replicas stay at zero until a restore has succeeded.
    pub async fn validate(
        &self,
        cluster: &mut DistributedRedisCluster,
    ) -> Result<Option<RedisClusterBackup>> {
        let mut backup = None;
        if let Some(init) = &cluster.spec.init {
            let source = init
                .backup_source
                .clone()
                .ok_or_else(|| Error::validation("backupSource is required"))?;
            let namespace = source
                .namespace
                .clone()
                .unwrap_or_else(|| cluster.namespace_or_default());
            let found = self.controls.backups.get_backup(&namespace, &source.name).await?;
            if found.phase() != BackupPhase::Succeeded {
                return Err(Error::BackupNotReady(format!("{}/{}", namespace, source.name)));
            }

            let recorded = found.status.clone().unwrap_or_default();
            if cluster.spec.image.is_empty() {
                cluster.spec.image = recorded.cluster_image;
            }
            cluster.spec.master_size = recorded.master_size;
            cluster.spec.cluster_replicas = if cluster.restore_succeeded() <= 0 {
                0
            } else {
                recorded.cluster_replicas
            };
            debug!(backup = %source.name, masters = cluster.spec.master_size, "Restoring from backup");
            backup = Some(found);
        }

        let name = cluster.name_any();
        cluster.spec.validate(&name)?;
        Ok(backup)
    }

    /// Validate, then create or update every resource the cluster runs on.
    pub async fn ensure_cluster(&self, cluster: &mut DistributedRedisCluster) -> SyncResult {
        let backup = match self.validate(cluster).await {
            Ok(backup) => backup,
            Err(e) if e.is_retryable() => return Err(ErrorKind::Kubernetes.wrap(e, "Validate")),
            Err(e) => return Err(ErrorKind::StopRetry.wrap(e, "Validate")),
        };
        let ensurer = &self.controls.ensurer;

        ensurer
            .ensure_config_map(cluster)
            .await
            .map_err(|e| ErrorKind::Kubernetes.wrap(e, "EnsureRedisConfigMap"))?;

        let updated = ensurer
            .ensure_statefulsets(cluster, backup.as_ref())
            .await
            .map_err(|e| ErrorKind::Kubernetes.wrap(e, "EnsureRedisStatefulSets"))?;
        if updated {
            info!(cluster = %cluster.name_any(), "StatefulSets updated, waiting for rollout");
            let waiter = WaitStatefulSetUpdating {
                statefulsets: self.controls.statefulsets.as_ref(),
                namespace: cluster.namespace_or_default(),
                cluster: cluster.name_any(),
                master_size: cluster.spec.master_size.max(0) as usize,
                tick: self.config.wait_tick(),
                timeout: self.config.wait_timeout(cluster.spec.cluster_replicas),
            };
            wait_until(&waiter)
                .await
                .map_err(|e| ErrorKind::Requeue.wrap(e, "WaitStatefulSetUpdating"))?;
        }

        ensurer
            .ensure_headless_services(cluster)
            .await
            .map_err(|e| ErrorKind::Kubernetes.wrap(e, "EnsureRedisHeadLessSvcs"))?;
        ensurer
            .ensure_client_service(cluster)
            .await
            .map_err(|e| ErrorKind::Kubernetes.wrap(e, "EnsureRedisSvc"))?;
        ensurer
            .ensure_osm_secret(cluster, backup.as_ref())
            .await
            .map_err(|e| {
                if e.is_retryable() {
                    ErrorKind::Kubernetes.wrap(e, "EnsureRedisOSMSecret")
                } else {
                    ErrorKind::StopRetry.wrap(e, "EnsureRedisOSMSecret")
                }
            })?;
        Ok(())
    }

    /// Recover stuck pods, then require every group to run its full pod count.
    pub async fn wait_pod_ready(
        &self,
        cluster: &DistributedRedisCluster,
        healer: &dyn Healer,
    ) -> SyncResult {
        healer
            .fix_terminating_pods(cluster, self.config.heal_allowance())
            .await
            .map_err(|e| ErrorKind::Kubernetes.wrap(e, "FixTerminatingPods"))?;
        self.controls
            .checker
            .check_redis_node_num(cluster)
            .await
            .map_err(|e| ErrorKind::Requeue.wrap(e, "CheckRedisNodeNum"))
    }

    /// Join every pooled node into one cluster unless they already agree.
    pub async fn wait_for_cluster_join(&self, admin: &dyn Admin, infos: &ClusterInfos) -> SyncResult {
        match admin.cluster_infos().await {
            Ok(current) if current.is_consistent() => {
                debug!(nodes = current.infos.len(), "Cluster already joined");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Cluster infos unavailable before join"),
        }

        let first = infos.first_node().ok_or_else(|| {
            ErrorKind::Requeue.wrap(
                RedisError::Inconsistent("no node to join the cluster through".to_string()),
                "AttachNodeToCluster",
            )
        })?;
        info!(node = %first.ip_port(), "Sending CLUSTER MEET messages to join the cluster");
        admin
            .attach_node_to_cluster(&first.ip_port())
            .await
            .map_err(|e| ErrorKind::Redis.wrap(e, "AttachNodeToCluster"))?;

        // Membership spreads by gossip; an immediate check would see empty,
        // trivially agreeing nodes.
        tokio::time::sleep(self.config.join_settle()).await;

        let joined = admin
            .cluster_infos()
            .await
            .map_err(|e| ErrorKind::Requeue.wrap(e, "WaitForClusterJoin"))?;
        joined
            .ensure_consistent()
            .map_err(|e| ErrorKind::Requeue.wrap(e, "WaitForClusterJoin"))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::k8s::{
        MockBackupControl, MockChecker, MockPdbControl, MockPvcControl, MockServiceControl,
        MockStatefulSetControl,
    };
    use std::sync::Mutex;

    /// Ensurer recording the calls it received.
    #[derive(Default)]
    pub struct RecordingEnsurer {
        pub calls: Mutex<Vec<&'static str>>,
        pub updated: bool,
        pub fail_osm: Option<fn() -> Error>,
    }

    impl RecordingEnsurer {
        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait::async_trait]
    impl Ensurer for RecordingEnsurer {
        async fn ensure_config_map(&self, _: &DistributedRedisCluster) -> Result<()> {
            self.record("config_map");
            Ok(())
        }

        async fn ensure_statefulsets(
            &self,
            _: &DistributedRedisCluster,
            _: Option<&RedisClusterBackup>,
        ) -> Result<bool> {
            self.record("statefulsets");
            Ok(self.updated)
        }

        async fn ensure_headless_services(&self, _: &DistributedRedisCluster) -> Result<()> {
            self.record("headless_services");
            Ok(())
        }

        async fn ensure_client_service(&self, _: &DistributedRedisCluster) -> Result<()> {
            self.record("client_service");
            Ok(())
        }

        async fn ensure_osm_secret(
            &self,
            _: &DistributedRedisCluster,
            _: Option<&RedisClusterBackup>,
        ) -> Result<()> {
            self.record("osm_secret");
            match self.fail_osm {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    /// Mock collaborators, to be configured by each test.
    #[derive(Default)]
    pub struct Mocks {
        pub statefulsets: MockStatefulSetControl,
        pub services: MockServiceControl,
        pub pdbs: MockPdbControl,
        pub pvcs: MockPvcControl,
        pub backups: MockBackupControl,
        pub checker: MockChecker,
    }

    impl Mocks {
        pub fn into_orchestrator(self, ensurer: Arc<RecordingEnsurer>) -> SyncOrchestrator {
            let controls = Controls {
                ensurer,
                statefulsets: Arc::new(self.statefulsets),
                services: Arc::new(self.services),
                pdbs: Arc::new(self.pdbs),
                pvcs: Arc::new(self.pvcs),
                backups: Arc::new(self.backups),
                checker: Arc::new(self.checker),
            };
            SyncOrchestrator::new(controls, OperatorConfig::default())
        }
    }

    pub fn cluster(spec: serde_json::Value) -> DistributedRedisCluster {
        let spec = serde_json::from_value(spec).unwrap();
        let mut cluster = DistributedRedisCluster::new("cache", spec);
        cluster.metadata.namespace = Some("prod".to_string());
        cluster
    }
}
