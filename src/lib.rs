//! Kubernetes operator for sharded, replicated Redis clusters.
//!
//! Each `DistributedRedisCluster` runs one StatefulSet per master group. A
//! reconcile tick makes sure that infrastructure exists and is ready, joins the
//! nodes into a single cluster, then brings the topology to the desired master
//! and replica counts:
//!
//! ```text
//! ensure_cluster ─▶ wait_pod_ready ─▶ wait_for_cluster_join ─▶ sync_cluster ─▶ [scaling_down]
//! ```
//!
//! Every failing step returns a [`error::SyncError`] whose kind decides how the
//! controller schedules the next tick.

pub mod clustering;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod k8s;
pub mod metrics;
pub mod redisutil;
pub mod sync;
pub mod wait;

pub use error::{Error, Result};
