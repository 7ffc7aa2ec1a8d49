//! Custom Resource Definitions for Redis clusters

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Image used when neither the spec nor a backup names one.
pub const DEFAULT_IMAGE: &str = "redis:5.0.4-alpine";

/// Smallest master count a cluster runs with.
pub const MIN_MASTER_SIZE: i32 = 3;

// ============================================================================
// DistributedRedisCluster CRD
// ============================================================================

/// DistributedRedisCluster represents a sharded Redis cluster
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "redis.kun",
    version = "v1alpha1",
    kind = "DistributedRedisCluster",
    plural = "distributedredisclusters",
    shortname = "drc",
    status = "DistributedRedisClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"MasterSize","type":"integer","jsonPath":".spec.masterSize"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    printcolumn = r#"{"name":"CurrentMasters","type":"integer","jsonPath":".status.numberOfMaster","priority":1}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DistributedRedisClusterSpec {
    /// Number of master groups
    #[serde(default = "default_master_size")]
    pub master_size: i32,

    /// Replicas per master
    #[serde(default = "default_cluster_replicas")]
    pub cluster_replicas: i32,

    /// Redis image; defaults to the backup's image when restoring
    #[serde(default)]
    pub image: String,

    /// Client service name; defaults to the cluster name
    #[serde(default)]
    pub service_name: String,

    /// Secret holding the `password` key used for AUTH
    #[serde(default)]
    pub password_secret: Option<String>,

    /// Extra redis.conf directives
    #[serde(default)]
    pub config: BTreeMap<String, String>,

    /// Persistent storage; pods use an emptyDir without it
    #[serde(default)]
    pub storage: Option<StorageSpec>,

    /// Resource requirements of the redis container
    #[serde(default)]
    pub resources: RedisResources,

    /// Restore from a backup on creation
    #[serde(default)]
    pub init: Option<InitSpec>,
}

fn default_master_size() -> i32 {
    3
}

fn default_cluster_replicas() -> i32 {
    1
}

/// Persistent storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Volume size
    #[serde(default = "default_storage_size")]
    pub size: String,

    /// Storage class for persistent volumes
    #[serde(default)]
    pub class: Option<String>,

    /// Delete claims together with the cluster
    #[serde(default)]
    pub delete_claim: bool,
}

fn default_storage_size() -> String {
    "1Gi".to_string()
}

/// Resource requirements for a redis node
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisResources {
    #[serde(default = "default_cpu_request")]
    pub cpu_request: String,

    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: String,

    #[serde(default = "default_memory_request")]
    pub memory_request: String,

    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
}

impl Default for RedisResources {
    fn default() -> Self {
        Self {
            cpu_request: default_cpu_request(),
            cpu_limit: default_cpu_limit(),
            memory_request: default_memory_request(),
            memory_limit: default_memory_limit(),
        }
    }
}

fn default_cpu_request() -> String {
    "100m".to_string()
}

fn default_cpu_limit() -> String {
    "1".to_string()
}

fn default_memory_request() -> String {
    "256Mi".to_string()
}

fn default_memory_limit() -> String {
    "1Gi".to_string()
}

/// Initialisation of a new cluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitSpec {
    /// Backup to restore from
    #[serde(default)]
    pub backup_source: Option<BackupSourceRef>,
}

/// Reference to a RedisClusterBackup
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSourceRef {
    pub name: String,

    /// Defaults to the cluster's namespace
    #[serde(default)]
    pub namespace: Option<String>,
}

impl DistributedRedisClusterSpec {
    /// Fill in defaults and reject values no cluster can run with.
    pub fn validate(&mut self, cluster_name: &str) -> Result<()> {
        if self.cluster_replicas < 0 {
            return Err(Error::validation(format!(
                "clusterReplicas must not be negative, got {}",
                self.cluster_replicas
            )));
        }
        if self.master_size < MIN_MASTER_SIZE {
            self.master_size = MIN_MASTER_SIZE;
        }
        if self.image.is_empty() {
            self.image = DEFAULT_IMAGE.to_string();
        }
        if self.service_name.is_empty() {
            self.service_name = cluster_name.to_string();
        }
        Ok(())
    }
}

/// Status of a DistributedRedisCluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DistributedRedisClusterStatus {
    /// Current phase
    #[serde(default)]
    pub status: ClusterPhase,

    /// Why the cluster is in this phase
    #[serde(default)]
    pub reason: Option<String>,

    /// Masters owning slots
    #[serde(default, rename = "numberOfMaster")]
    pub num_of_master: i32,

    #[serde(default)]
    pub min_replication_factor: i32,

    #[serde(default)]
    pub max_replication_factor: i32,

    /// Set to 1 once a cluster restored from a backup became healthy
    #[serde(default)]
    pub restore_succeeded: i32,

    #[serde(default)]
    pub nodes: Vec<RedisClusterNode>,
}

/// Cluster phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterPhase {
    #[default]
    Creating,
    Healthy,
    Scaling,
    Rebalancing,
    Failed,
}

impl ClusterPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterPhase::Creating => "Creating",
            ClusterPhase::Healthy => "Healthy",
            ClusterPhase::Scaling => "Scaling",
            ClusterPhase::Rebalancing => "Rebalancing",
            ClusterPhase::Failed => "Failed",
        }
    }
}

/// Status of an individual redis node
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisClusterNode {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub role: String,
    pub pod_name: Option<String>,
    pub master_ref: Option<String>,
    /// Owned slot ranges, e.g. `0-5460`
    #[serde(default)]
    pub slots: String,
}

impl DistributedRedisCluster {
    /// Whether the cluster is created from a backup.
    pub fn is_restoring(&self) -> bool {
        self.spec.init.is_some()
    }

    pub fn restore_succeeded(&self) -> i32 {
        self.status.as_ref().map_or(0, |s| s.restore_succeeded)
    }

    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }
}

// ============================================================================
// RedisClusterBackup CRD
// ============================================================================

/// RedisClusterBackup records a backup of a DistributedRedisCluster
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "redis.kun",
    version = "v1alpha1",
    kind = "RedisClusterBackup",
    plural = "redisclusterbackups",
    shortname = "drcb",
    status = "RedisClusterBackupStatus",
    namespaced,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.redisClusterName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RedisClusterBackupSpec {
    /// Cluster that was backed up
    pub redis_cluster_name: String,

    /// Secret with the object storage credentials
    #[serde(default)]
    pub storage_secret_name: Option<String>,
}

/// Status of a backup
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisClusterBackupStatus {
    #[serde(default)]
    pub phase: BackupPhase,

    /// Image of the cluster at backup time
    #[serde(default)]
    pub cluster_image: String,

    #[serde(default)]
    pub master_size: i32,

    #[serde(default)]
    pub cluster_replicas: i32,

    #[serde(default)]
    pub reason: Option<String>,
}

/// Backup phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum BackupPhase {
    #[default]
    Running,
    Succeeded,
    Failed,
}

impl RedisClusterBackup {
    pub fn phase(&self) -> BackupPhase {
        self.status.as_ref().map_or(BackupPhase::Running, |s| s.phase)
    }
}
