//! Topology sync: bring the running cluster to the desired master and replica counts.

use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::{error, info, warn};

use super::{SyncOrchestrator, WaitPodTerminating};
use crate::clustering::TopologyContext;
use crate::crd::DistributedRedisCluster;
use crate::error::{Error, ErrorKind, RedisError, SyncError, SyncResult};
use crate::k8s::{headless_service_name, pdb_name, statefulset_name};
use crate::redisutil::{Admin, ClusterInfos, Nodes};
use crate::wait::wait_until;

/// Branch taken by [`SyncOrchestrator::sync_cluster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Topology already matches the desired state.
    None,
    /// No master owned slots: replicas placed, full slot space allocated.
    Bootstrap,
    /// Masters added and slots rebalanced over the enlarged set.
    ScaleUp,
    /// Additional replicas attached.
    ScaleReplicas,
    /// Slots moved off the highest groups, which were then retired.
    ScaleDown,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::None => "none",
            SyncAction::Bootstrap => "bootstrap",
            SyncAction::ScaleUp => "scale_up",
            SyncAction::ScaleReplicas => "scale_replicas",
            SyncAction::ScaleDown => "scale_down",
        }
    }
}

fn topology_err(step: &'static str) -> impl FnOnce(Error) -> SyncError {
    move |e| ErrorKind::Cluster.wrap(e, step)
}

impl SyncOrchestrator {
    /// Plan the topology from `infos` and apply the first matching branch:
    /// bootstrap, scale up, scale replicas, scale down.
    pub async fn sync_cluster(
        &self,
        cluster: &DistributedRedisCluster,
        admin: &dyn Admin,
        infos: &ClusterInfos,
        groups: &BTreeMap<usize, Nodes>,
    ) -> SyncResult<SyncAction> {
        let name = cluster.name_any();
        let expected_masters = cluster.spec.master_size.max(0) as usize;
        let replicas = cluster.spec.cluster_replicas.max(0);
        let mut ctx =
            TopologyContext::new(&name, infos, groups, expected_masters, replicas as usize);
        ctx.dispatch_masters().map_err(topology_err("DispatchMasters"))?;

        let current = ctx.current_masters();
        let new = ctx.new_masters();
        info!(cluster = %name, new_masters = new.len(), current_masters = current.len(), "Masters");
        // Groups above the target stay until retired, even once their masters lost every slot.
        let group_count = groups
            .keys()
            .next_back()
            .map_or(0, |g| g + 1)
            .max(current.len());

        if current.is_empty() {
            info!(cluster = %name, "Creating cluster");
            self.place_and_attach(&mut ctx, admin).await?;
            ctx.alloc_slots(admin, &new)
                .await
                .map_err(topology_err("AllocSlots"))?;
            Ok(SyncAction::Bootstrap)
        } else if new.len() > current.len() {
            info!(cluster = %name, "Scaling up");
            self.place_and_attach(&mut ctx, admin).await?;
            ctx.rebalance_cluster(admin, &new)
                .await
                .map_err(topology_err("RebalancedCluster"))?;
            Ok(SyncAction::ScaleUp)
        } else if infos.min_replication_factor() < replicas {
            info!(
                cluster = %name,
                observed = infos.min_replication_factor(),
                desired = replicas,
                "Scaling replicas"
            );
            self.place_and_attach(&mut ctx, admin).await?;
            Ok(SyncAction::ScaleReplicas)
        } else if group_count > expected_masters {
            info!(cluster = %name, groups = group_count, "Scaling down");
            let all_masters: Nodes = new.iter().chain(current.iter()).cloned().collect();
            ctx.dispatch_slots_to_new_masters(admin, &new, &current, &all_masters)
                .await
                .map_err(topology_err("DispatchSlotToNewMasters"))?;

            let groups = refreshed_groups(admin, &ctx).await?;
            self.scaling_down(cluster, admin, group_count, &groups)
                .await?;
            Ok(SyncAction::ScaleDown)
        } else {
            Ok(SyncAction::None)
        }
    }

    async fn place_and_attach(&self, ctx: &mut TopologyContext, admin: &dyn Admin) -> SyncResult {
        ctx.place_slaves().map_err(topology_err("PlaceSlaves"))?;
        ctx.attach_slaves_to_master(admin)
            .await
            .map_err(topology_err("AttachingSlavesToMaster"))
    }

    /// Retire the groups from `group_count - 1` down to the desired master
    /// count, highest ordinal first.
    ///
    /// Every node of the retiring groups leaves the connection pool before any
    /// of them is forgotten or deleted. A group is only removed once none of
    /// its nodes owns a slot.
    pub async fn scaling_down(
        &self,
        cluster: &DistributedRedisCluster,
        admin: &dyn Admin,
        group_count: usize,
        groups: &BTreeMap<usize, Nodes>,
    ) -> SyncResult {
        let name = cluster.name_any();
        let namespace = cluster.namespace_or_default();
        let expected = cluster.spec.master_size.max(0) as usize;
        let retiring: Vec<usize> = (expected..group_count).rev().collect();
        let empty = Nodes::new();

        for ordinal in &retiring {
            for node in groups.get(ordinal).unwrap_or(&empty) {
                admin.remove_node_connection(&node.ip_port()).await;
            }
        }

        for ordinal in retiring {
            let sts_name = statefulset_name(&name, ordinal);
            info!(cluster = %name, statefulset = %sts_name, "Scaling down");
            let sts = self
                .controls
                .statefulsets
                .get_statefulset(&namespace, &sts_name)
                .await
                .map_err(|e| ErrorKind::Kubernetes.wrap(e, "GetStatefulSet"))?;

            let nodes = groups.get(&ordinal).unwrap_or(&empty);
            if let Some(node) = nodes.iter().find(|n| n.has_slots()) {
                return Err(ErrorKind::Redis.wrap(RedisError::NodeNotEmpty(node.to_string()), "ScalingDown"));
            }
            for node in nodes {
                info!(id = %node.id, ip = %node.ip, role = %node.role, "Forgetting node");
                admin
                    .forget_node(&node.id)
                    .await
                    .map_err(|e| ErrorKind::Redis.wrap(e, "ForgetNode"))?;
            }

            if let Err(e) = self.controls.statefulsets.delete_statefulset(&namespace, &sts_name).await {
                error!(error = %e, statefulset = %sts_name, "Failed to delete StatefulSet");
            }
            let svc_name = headless_service_name(&name, ordinal);
            if let Err(e) = self.controls.services.delete_service(&namespace, &svc_name).await {
                error!(error = %e, service = %svc_name, "Failed to delete headless Service");
            }
            let pdb = pdb_name(&name, ordinal);
            if let Err(e) = self.controls.pdbs.delete_pdb(&namespace, &pdb).await {
                error!(error = %e, pdb = %pdb, "Failed to delete PodDisruptionBudget");
            }
            if let Err(e) = self.controls.pvcs.delete_pvcs_by_labels(&namespace, sts.labels()).await {
                error!(error = %e, labels = ?sts.labels(), "Failed to delete PVCs");
            }

            let waiter = WaitPodTerminating {
                statefulsets: self.controls.statefulsets.as_ref(),
                namespace: namespace.clone(),
                statefulset: sts_name.clone(),
                tick: self.config.wait_tick(),
                timeout: self.config.wait_timeout(cluster.spec.cluster_replicas),
            };
            if let Err(e) = wait_until(&waiter).await {
                warn!(error = %e, statefulset = %sts_name, "Pods still terminating");
            }
        }
        Ok(())
    }
}

/// Group nodes as the cluster reports them after slot dispatch, so the
/// emptiness check sees what the nodes actually own.
async fn refreshed_groups(
    admin: &dyn Admin,
    ctx: &TopologyContext,
) -> SyncResult<BTreeMap<usize, Nodes>> {
    let fresh = admin
        .cluster_infos()
        .await
        .map_err(|e| ErrorKind::Requeue.wrap(e, "GetClusterInfos"))?;
    Ok(ctx
        .group_nodes()
        .into_iter()
        .map(|(ordinal, nodes)| {
            let nodes = nodes
                .into_iter()
                .map(|local| match fresh.node_by_id(&local.id) {
                    Some(node) => {
                        let mut node = node.clone();
                        node.pod_name = local.pod_name;
                        node
                    }
                    None => local,
                })
                .collect();
            (ordinal, nodes)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::clustering::test_support::{node, replica_of, snapshot, with_slots};
    use crate::error::Disposition;
    use crate::k8s::LABEL_STATEFULSET;
    use crate::redisutil::{MockAdmin, Node};
    use k8s_openapi::api::apps::v1::StatefulSet;
    use std::sync::Arc;

    fn groups_of(nodes: &[Node]) -> BTreeMap<usize, Nodes> {
        crate::clustering::test_support::groups(nodes)
    }

    fn sts(name: &str) -> StatefulSet {
        let mut s = StatefulSet::default();
        s.metadata.name = Some(name.to_string());
        s.metadata.labels = Some([(LABEL_STATEFULSET.to_string(), name.to_string())].into_iter().collect());
        s
    }

    #[tokio::test]
    async fn test_bootstrap_allocates_slot_space() {
        let nodes: Vec<Node> = (0..3).map(|g| node(g, 0)).collect();
        let orchestrator = Mocks::default().into_orchestrator(Arc::new(RecordingEnsurer::default()));
        let c = cluster(serde_json::json!({"masterSize": 3, "clusterReplicas": 0}));

        let mut admin = MockAdmin::new();
        admin
            .expect_add_slots()
            .times(3)
            .returning(|_, _| Ok(()));
        admin.expect_migrate_slots().never();

        let action = orchestrator
            .sync_cluster(&c, &admin, &snapshot(&nodes), &groups_of(&nodes))
            .await
            .unwrap();
        assert_eq!(action, SyncAction::Bootstrap);
    }

    #[tokio::test]
    async fn test_replica_factor_increase_only_attaches() {
        let masters = crate::clustering::test_support::even_masters(3);
        let mut nodes = masters.clone();
        nodes.extend((0..3).map(|g| node(g, 1)));
        let orchestrator = Mocks::default().into_orchestrator(Arc::new(RecordingEnsurer::default()));
        let c = cluster(serde_json::json!({"masterSize": 3, "clusterReplicas": 1}));

        let mut admin = MockAdmin::new();
        admin
            .expect_attach_slave_to_master()
            .times(3)
            .returning(|_, _| Ok(()));
        admin.expect_add_slots().never();
        admin.expect_migrate_slots().never();

        let action = orchestrator
            .sync_cluster(&c, &admin, &snapshot(&nodes), &groups_of(&nodes))
            .await
            .unwrap();
        assert_eq!(action, SyncAction::ScaleReplicas);
    }

    #[tokio::test]
    async fn test_settled_cluster_is_left_alone() {
        let masters = crate::clustering::test_support::even_masters(3);
        let mut nodes = masters.clone();
        for (g, m) in masters.iter().enumerate() {
            nodes.push(replica_of(node(g, 1), m));
        }
        let orchestrator = Mocks::default().into_orchestrator(Arc::new(RecordingEnsurer::default()));
        let c = cluster(serde_json::json!({"masterSize": 3, "clusterReplicas": 1}));
        let admin = MockAdmin::new();

        let action = orchestrator
            .sync_cluster(&c, &admin, &snapshot(&nodes), &groups_of(&nodes))
            .await
            .unwrap();
        assert_eq!(action, SyncAction::None);
    }

    #[tokio::test]
    async fn test_topology_failure_is_cluster_kind() {
        let nodes = vec![node(0, 0), node(2, 0)];
        let orchestrator = Mocks::default().into_orchestrator(Arc::new(RecordingEnsurer::default()));
        let c = cluster(serde_json::json!({"masterSize": 3, "clusterReplicas": 0}));

        let err = orchestrator
            .sync_cluster(&c, &MockAdmin::new(), &snapshot(&nodes), &groups_of(&nodes))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cluster);
        assert_eq!(err.step(), "DispatchMasters");
    }

    #[tokio::test]
    async fn test_scaling_down_refuses_non_empty_group() {
        let mut mocks = Mocks::default();
        mocks
            .statefulsets
            .expect_get_statefulset()
            .returning(|_, name| Ok(sts(name)));
        mocks.statefulsets.expect_delete_statefulset().never();
        mocks.services.expect_delete_service().never();
        let orchestrator = mocks.into_orchestrator(Arc::new(RecordingEnsurer::default()));
        let c = cluster(serde_json::json!({"masterSize": 3, "clusterReplicas": 0}));

        let nodes = vec![node(3, 0), with_slots(node(4, 0), 0, 99)];
        let mut admin = MockAdmin::new();
        admin
            .expect_remove_node_connection()
            .times(2)
            .returning(|_| ());
        admin.expect_forget_node().never();

        let err = orchestrator
            .scaling_down(&c, &admin, 5, &groups_of(&nodes))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.disposition(), Disposition::StopRetry);
        assert!(err.to_string().contains("node-4-0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scaling_down_retires_highest_group_first() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut mocks = Mocks::default();
        mocks
            .statefulsets
            .expect_get_statefulset()
            .returning(|_, name| Ok(sts(name)));
        let deleted = order.clone();
        mocks
            .statefulsets
            .expect_delete_statefulset()
            .returning(move |_, name| {
                deleted.lock().unwrap().push(name.to_string());
                Ok(())
            });
        mocks
            .statefulsets
            .expect_list_statefulset_pods()
            .returning(|_, _| Ok(vec![]));
        mocks
            .services
            .expect_delete_service()
            .times(2)
            .returning(|_, _| Err(Error::NotFound("svc".to_string())));
        mocks.pdbs.expect_delete_pdb().times(2).returning(|_, _| Ok(()));
        mocks
            .pvcs
            .expect_delete_pvcs_by_labels()
            .withf(|_, labels| labels.contains_key(LABEL_STATEFULSET))
            .times(2)
            .returning(|_, _| Ok(()));
        let orchestrator = mocks.into_orchestrator(Arc::new(RecordingEnsurer::default()));
        let c = cluster(serde_json::json!({"masterSize": 3, "clusterReplicas": 1}));

        let nodes = vec![node(3, 0), node(3, 1), node(4, 0), node(4, 1)];
        let mut admin = MockAdmin::new();
        admin
            .expect_remove_node_connection()
            .times(4)
            .returning(|_| ());
        admin.expect_forget_node().times(4).returning(|_| Ok(()));

        orchestrator
            .scaling_down(&c, &admin, 5, &groups_of(&nodes))
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["drc-cache-4", "drc-cache-3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emptied_group_above_target_is_retired() {
        let mut mocks = Mocks::default();
        mocks
            .statefulsets
            .expect_get_statefulset()
            .returning(|_, name| Ok(sts(name)));
        mocks
            .statefulsets
            .expect_delete_statefulset()
            .withf(|_, name| format!("{}", name) == "drc-cache-3")
            .times(1)
            .returning(|_, _| Ok(()));
        mocks
            .statefulsets
            .expect_list_statefulset_pods()
            .returning(|_, _| Ok(vec![]));
        mocks.services.expect_delete_service().times(1).returning(|_, _| Ok(()));
        mocks.pdbs.expect_delete_pdb().times(1).returning(|_, _| Ok(()));
        mocks
            .pvcs
            .expect_delete_pvcs_by_labels()
            .times(1)
            .returning(|_, _| Ok(()));
        let orchestrator = mocks.into_orchestrator(Arc::new(RecordingEnsurer::default()));
        let c = cluster(serde_json::json!({"masterSize": 3, "clusterReplicas": 0}));

        let mut nodes = crate::clustering::test_support::even_masters(3);
        nodes.push(node(3, 0));
        let infos = snapshot(&nodes);
        let mut admin = MockAdmin::new();
        admin.expect_migrate_slots().never();
        admin.expect_add_slots().never();
        let fresh = infos.clone();
        admin
            .expect_cluster_infos()
            .returning(move || Ok(fresh.clone()));
        admin
            .expect_remove_node_connection()
            .withf(|addr| format!("{}", addr) == "10.0.3.1:6379")
            .times(1)
            .returning(|_| ());
        admin
            .expect_forget_node()
            .withf(|id| format!("{}", id) == "node-3-0")
            .times(1)
            .returning(|_| Ok(()));

        let action = orchestrator
            .sync_cluster(&c, &admin, &infos, &groups_of(&nodes))
            .await
            .unwrap();
        assert_eq!(action, SyncAction::ScaleDown);
    }
}
