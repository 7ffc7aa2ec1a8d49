//! Kubernetes controller for DistributedRedisCluster resources

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller as KubeController};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::config::OperatorConfig;
use crate::crd::{
    ClusterPhase, DistributedRedisCluster, DistributedRedisClusterStatus, RedisClusterNode,
};
use crate::error::{Disposition, Error, ErrorKind, SyncError, SyncResult};
use crate::k8s::{
    common_labels, label_selector, KubeChecker, KubeControls, KubeEnsurer, KubeHealer,
    StatefulSetControl, FIELD_MANAGER,
};
use crate::metrics;
use crate::redisutil::{
    format_slots, AdminConnections, AdminOptions, ClusterInfos, RedisAdmin, RespConnection,
};
use crate::sync::{pod_endpoints, Controls, PodEndpoint, SyncAction, SyncContext, SyncOrchestrator};

/// Connection pools and backoff counters per cluster, keyed by `namespace/name`.
struct ClusterRegistry<C> {
    pools: Mutex<HashMap<String, Arc<AdminConnections<C>>>>,
    /// Consecutive backoff-class failures.
    failures: Mutex<HashMap<String, u32>>,
}

impl<C> Default for ClusterRegistry<C> {
    fn default() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<C: Send> ClusterRegistry<C> {
    fn pool(&self, key: &str) -> Arc<AdminConnections<C>> {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools.entry(key.to_string()).or_default().clone()
    }

    fn next_attempt(&self, key: &str) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let attempt = failures.entry(key.to_string()).or_insert(0);
        *attempt += 1;
        *attempt
    }

    fn reset_failures(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Drop every cluster not in `live` and close its pooled connections.
    ///
    /// Returns the dropped keys, sorted.
    async fn close_departed(&self, live: &HashSet<String>) -> Vec<String> {
        let departed: Vec<(String, Arc<AdminConnections<C>>)> = {
            let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<String> = pools.keys().filter(|k| !live.contains(*k)).cloned().collect();
            keys.into_iter()
                .filter_map(|k| pools.remove(&k).map(|pool| (k, pool)))
                .collect()
        };
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|k, _| live.contains(k));

        let mut keys = Vec::with_capacity(departed.len());
        for (key, pool) in departed {
            let closed = pool.retain(&[]).await;
            info!(cluster = %key, connections = closed.len(), "Closed connections of deleted cluster");
            keys.push(key);
        }
        keys.sort();
        keys
    }
}

fn cluster_key(cluster: &DistributedRedisCluster) -> String {
    format!("{}/{}", cluster.namespace_or_default(), cluster.name_any())
}

/// Shared state of the reconcile loop.
pub struct ControllerState {
    pub client: Client,
    pub orchestrator: SyncOrchestrator,
    pub healer: KubeHealer,
    pub admin_options: AdminOptions,
    registry: ClusterRegistry<RespConnection>,
}

impl ControllerState {
    pub fn new(client: Client, config: OperatorConfig, admin_options: AdminOptions) -> Self {
        let kube = KubeControls::new(client.clone());
        let statefulsets: Arc<dyn StatefulSetControl> = Arc::new(kube.clone());
        let controls = Controls {
            ensurer: Arc::new(KubeEnsurer::new(client.clone())),
            checker: Arc::new(KubeChecker::new(statefulsets.clone())),
            statefulsets,
            services: Arc::new(kube.clone()),
            pdbs: Arc::new(kube.clone()),
            pvcs: Arc::new(kube.clone()),
            backups: Arc::new(kube),
        };
        Self {
            healer: KubeHealer::new(client.clone()),
            client,
            orchestrator: SyncOrchestrator::new(controls, config),
            admin_options,
            registry: ClusterRegistry::default(),
        }
    }

    fn config(&self) -> &OperatorConfig {
        self.orchestrator.config()
    }
}

/// Main controller for DistributedRedisCluster resources
pub struct Controller {
    client: Client,
    namespace: String,
    state: Arc<ControllerState>,
}

impl Controller {
    pub async fn new(
        namespace: String,
        config: OperatorConfig,
        admin_options: AdminOptions,
    ) -> Result<Self, Error> {
        let client = Client::try_default().await?;
        let state = ControllerState::new(client.clone(), config, admin_options);
        Ok(Self {
            client,
            namespace,
            state: Arc::new(state),
        })
    }

    pub async fn run(&self) -> Result<(), Error> {
        info!("Starting redis cluster controller");

        let (clusters, statefulsets): (Api<DistributedRedisCluster>, Api<StatefulSet>) =
            if self.namespace.is_empty() {
                (Api::all(self.client.clone()), Api::all(self.client.clone()))
            } else {
                (
                    Api::namespaced(self.client.clone(), &self.namespace),
                    Api::namespaced(self.client.clone(), &self.namespace),
                )
            };

        if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
            error!("Failed to list DistributedRedisClusters. Is the CRD installed? Error: {}", e);
            return Err(Error::NotFound("DistributedRedisCluster CRD".to_string()));
        }
        info!("CRD verification successful");

        let controller =
            KubeController::new(clusters, Config::default()).owns(statefulsets, Config::default());

        // Deleted clusters are never reconciled again; sweep their pools from the cache.
        let store = controller.store();
        let sweep_state = Arc::clone(&self.state);
        let sweep_every = sweep_state.config().healthy_requeue().max(Duration::from_secs(1));
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            loop {
                ticker.tick().await;
                let live: HashSet<String> = store.state().iter().map(|c| cluster_key(c)).collect();
                sweep_state.registry.close_departed(&live).await;
            }
        });

        controller
            .shutdown_on_signal()
            .run(reconcile, error_policy, Arc::clone(&self.state))
            .for_each(|result| async move {
                match result {
                    Ok((obj, action)) => {
                        debug!(name = %obj.name, ?action, "Reconciliation successful");
                    }
                    Err(e) => {
                        debug!(error = %e, "Reconciliation error");
                    }
                }
            })
            .await;

        sweeper.abort();
        info!("Controller stopped");
        Ok(())
    }
}

async fn reconcile(
    cluster: Arc<DistributedRedisCluster>,
    state: Arc<ControllerState>,
) -> SyncResult<Action> {
    let started = Instant::now();
    let name = cluster.name_any();
    let namespace = cluster.namespace_or_default();
    let key = cluster_key(&cluster);
    info!(cluster = %name, namespace = %namespace, "Reconciling DistributedRedisCluster");

    let pods = list_pods(&state.client, &namespace, &name)
        .await
        .map_err(|e| ErrorKind::Kubernetes.wrap(e, "ListPods"))?;
    let endpoints = pod_endpoints(&name, &pods);
    let addrs: Vec<String> = endpoints.iter().map(PodEndpoint::addr).collect();

    let pool = state.registry.pool(&key);
    let pruned = pool.retain(&addrs).await;
    if !pruned.is_empty() {
        debug!(cluster = %name, pruned = ?pruned, "Dropped connections to departed pods");
    }
    let admin = RedisAdmin::connect(&addrs, pool, state.admin_options.clone()).await;

    let mut ctx = SyncContext {
        cluster: (*cluster).clone(),
        cluster_infos: ClusterInfos::default(),
        admin: &admin,
        healer: &state.healer,
        pods: endpoints,
    };
    let result = state.orchestrator.run(&mut ctx).await;
    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(action) => {
            state.registry.reset_failures(&key);
            metrics::record_reconciliation_success(&name, elapsed);
            if action != SyncAction::None {
                metrics::record_topology_action(&name, action.as_str());
            }
            let status = build_status(&cluster, &ctx.cluster_infos, &ctx.pods, action);
            metrics::set_masters(&namespace, &name, status.num_of_master.max(0) as usize);
            update_status(&state.client, &namespace, &name, &status)
                .await
                .map_err(|e| ErrorKind::Kubernetes.wrap(e, "UpdateStatus"))?;

            if action == SyncAction::None {
                Ok(Action::requeue(state.config().healthy_requeue()))
            } else {
                info!(cluster = %name, action = action.as_str(), "Topology updated");
                Ok(Action::requeue(state.config().requeue_after()))
            }
        }
        Err(e) => {
            metrics::record_reconciliation_failure(&name, elapsed);
            if e.disposition() == Disposition::StopRetry {
                let status = failed_status(&cluster, &e);
                if let Err(err) = update_status(&state.client, &namespace, &name, &status).await {
                    warn!(cluster = %name, error = %err, "Failed to record failure in status");
                }
            }
            Err(e)
        }
    }
}

fn error_policy(
    cluster: Arc<DistributedRedisCluster>,
    error: &SyncError,
    state: Arc<ControllerState>,
) -> Action {
    let name = cluster.name_any();
    let key = cluster_key(&cluster);
    metrics::record_error(error.kind().as_str(), error.step());
    match error.disposition() {
        Disposition::StopRetry => {
            state.registry.reset_failures(&key);
            error!(cluster = %name, step = error.step(), error = %error, "Reconciliation stopped");
            Action::await_change()
        }
        Disposition::RequeueAfter => {
            info!(cluster = %name, step = error.step(), reason = %error.cause(), "Requeueing");
            Action::requeue(state.config().requeue_after())
        }
        Disposition::Backoff => {
            let attempt = state.registry.next_attempt(&key);
            let delay = state.config().backoff.delay_for_attempt(attempt);
            warn!(
                cluster = %name,
                step = error.step(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Reconciliation error, will retry"
            );
            Action::requeue(delay)
        }
    }
}

async fn list_pods(client: &Client, namespace: &str, cluster: &str) -> Result<Vec<Pod>, Error> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(&label_selector(&common_labels(cluster)));
    Ok(api.list(&lp).await?.items)
}

/// Status reflecting the snapshot taken after a successful sync.
pub fn build_status(
    cluster: &DistributedRedisCluster,
    infos: &ClusterInfos,
    pods: &[PodEndpoint],
    action: SyncAction,
) -> DistributedRedisClusterStatus {
    let previous = cluster.status.clone().unwrap_or_default();
    let phase = match action {
        SyncAction::None => ClusterPhase::Healthy,
        SyncAction::Bootstrap => ClusterPhase::Creating,
        SyncAction::ScaleReplicas => ClusterPhase::Scaling,
        SyncAction::ScaleUp | SyncAction::ScaleDown => ClusterPhase::Rebalancing,
    };
    let restore_succeeded = if cluster.is_restoring() && phase == ClusterPhase::Healthy {
        previous.restore_succeeded.max(1)
    } else {
        previous.restore_succeeded
    };

    let nodes = infos
        .nodes()
        .into_iter()
        .map(|n| RedisClusterNode {
            pod_name: pods.iter().find(|p| p.ip == n.ip).map(|p| p.name.clone()),
            role: n.role.to_string(),
            slots: format_slots(&n.slots),
            id: n.id,
            ip: n.ip,
            port: n.port,
            master_ref: n.master_ref,
        })
        .collect();

    DistributedRedisClusterStatus {
        status: phase,
        reason: None,
        num_of_master: infos.masters_with_slots().len() as i32,
        min_replication_factor: infos.min_replication_factor(),
        max_replication_factor: infos.max_replication_factor(),
        restore_succeeded,
        nodes,
    }
}

/// Previous status marked Failed with the error as reason.
pub fn failed_status(cluster: &DistributedRedisCluster, err: &SyncError) -> DistributedRedisClusterStatus {
    DistributedRedisClusterStatus {
        status: ClusterPhase::Failed,
        reason: Some(err.to_string()),
        ..cluster.status.clone().unwrap_or_default()
    }
}

async fn update_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &DistributedRedisClusterStatus,
) -> Result<(), Error> {
    let api: Api<DistributedRedisCluster> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    let pp = PatchParams::apply(FIELD_MANAGER);
    api.patch_status(name, &pp, &Patch::Merge(&patch)).await?;
    debug!(name = %name, phase = status.status.as_str(), "Status updated");
    Ok(())
}
