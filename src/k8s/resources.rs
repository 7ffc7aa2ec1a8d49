//! Manifests for the resources of a cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, ExecAction, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    SecretKeySelector, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use super::{
    common_labels, config_map_name, group_labels, headless_service_name, pdb_name,
    statefulset_name,
};
use crate::crd::{DistributedRedisCluster, RedisClusterBackup};

pub const REDIS_PORT: i32 = 6379;
pub const REDIS_BUS_PORT: i32 = 16379;
pub const CONTAINER_NAME: &str = "redis";
/// Env var carrying the AUTH password inside the pod.
pub const PASSWORD_ENV: &str = "REDIS_PASSWORD";
/// Annotation naming the backup a StatefulSet restores from.
pub const RESTORE_ANNOTATION: &str = "redis.kun/restore-from";

const CONF_DIR: &str = "/conf";
const DATA_DIR: &str = "/data";

fn owner_references(cluster: &DistributedRedisCluster) -> Option<Vec<OwnerReference>> {
    cluster.controller_owner_ref(&()).map(|r| vec![r])
}

fn metadata(
    cluster: &DistributedRedisCluster,
    name: String,
    labels: BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(cluster.namespace_or_default()),
        labels: Some(labels),
        owner_references: owner_references(cluster),
        ..Default::default()
    }
}

/// `redis.conf` for cluster mode plus the spec's extra directives.
pub fn redis_conf(cluster: &DistributedRedisCluster) -> String {
    let mut conf = vec![
        "cluster-enabled yes".to_string(),
        format!("cluster-config-file {}/nodes.conf", DATA_DIR),
        "cluster-node-timeout 5000".to_string(),
        format!("dir {}", DATA_DIR),
        "appendonly yes".to_string(),
        "protected-mode no".to_string(),
    ];
    conf.extend(cluster.spec.config.iter().map(|(k, v)| format!("{} {}", k, v)));
    conf.join("\n") + "\n"
}

/// Rewrites this node's address in `nodes.conf` after a pod restart.
const FIX_IP_SCRIPT: &str = r#"#!/bin/sh
CLUSTER_CONFIG="/data/nodes.conf"
if [ -f ${CLUSTER_CONFIG} ]; then
  if [ -z "${POD_IP}" ]; then
    echo "Unable to determine Pod IP address!"
    exit 1
  fi
  sed -i.bak -e "/myself/ s/ .*:6379@16379/ ${POD_IP}:6379@16379/" ${CLUSTER_CONFIG}
fi
exec "$@"
"#;

pub fn config_map(cluster: &DistributedRedisCluster) -> ConfigMap {
    let name = cluster.name_any();
    let mut data = BTreeMap::new();
    data.insert("redis.conf".to_string(), redis_conf(cluster));
    data.insert("fix-ip.sh".to_string(), FIX_IP_SCRIPT.to_string());

    ConfigMap {
        metadata: metadata(cluster, config_map_name(&name), common_labels(&name)),
        data: Some(data),
        ..Default::default()
    }
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    map.insert("cpu".to_string(), Quantity(cpu.to_string()));
    map.insert("memory".to_string(), Quantity(memory.to_string()));
    map
}

fn redis_container(cluster: &DistributedRedisCluster) -> Container {
    let spec = &cluster.spec;
    let mut env = vec![
        field_env("POD_IP", "status.podIP"),
        field_env("POD_NAME", "metadata.name"),
    ];
    let mut args = vec![
        format!("{}/redis.conf", CONF_DIR),
        "--cluster-announce-ip".to_string(),
        "$(POD_IP)".to_string(),
    ];
    let mut probe_cmd = "redis-cli -h $(hostname) ping".to_string();
    if let Some(secret) = &spec.password_secret {
        env.push(EnvVar {
            name: PASSWORD_ENV.to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: Some(secret.clone()),
                    key: "password".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        args.extend([
            "--requirepass".to_string(),
            format!("$({})", PASSWORD_ENV),
            "--masterauth".to_string(),
            format!("$({})", PASSWORD_ENV),
        ]);
        probe_cmd = format!("redis-cli -h $(hostname) -a \"${}\" ping", PASSWORD_ENV);
    }

    let probe = Probe {
        exec: Some(ExecAction {
            command: Some(vec!["sh".to_string(), "-c".to_string(), probe_cmd]),
        }),
        initial_delay_seconds: Some(10),
        period_seconds: Some(5),
        timeout_seconds: Some(5),
        ..Default::default()
    };

    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(spec.image.clone()),
        command: Some(vec![
            "/bin/sh".to_string(),
            format!("{}/fix-ip.sh", CONF_DIR),
            "redis-server".to_string(),
        ]),
        args: Some(args),
        ports: Some(vec![
            ContainerPort {
                container_port: REDIS_PORT,
                name: Some("client".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: REDIS_BUS_PORT,
                name: Some("gossip".to_string()),
                ..Default::default()
            },
        ]),
        env: Some(env),
        resources: Some(ResourceRequirements {
            requests: Some(quantities(&spec.resources.cpu_request, &spec.resources.memory_request)),
            limits: Some(quantities(&spec.resources.cpu_limit, &spec.resources.memory_limit)),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "data".to_string(),
                mount_path: DATA_DIR.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "conf".to_string(),
                mount_path: CONF_DIR.to_string(),
                ..Default::default()
            },
        ]),
        liveness_probe: Some(probe.clone()),
        readiness_probe: Some(probe),
        ..Default::default()
    }
}

/// StatefulSet of group `ordinal`: one master pod plus `clusterReplicas` replica pods.
pub fn statefulset(
    cluster: &DistributedRedisCluster,
    ordinal: usize,
    backup: Option<&RedisClusterBackup>,
) -> StatefulSet {
    let name = cluster.name_any();
    let labels = group_labels(&name, ordinal);

    let mut annotations = BTreeMap::new();
    if let Some(backup) = backup {
        annotations.insert(RESTORE_ANNOTATION.to_string(), backup.name_any());
    }

    let mut volumes = vec![Volume {
        name: "conf".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(config_map_name(&name)),
            default_mode: Some(0o755),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let claims = match &cluster.spec.storage {
        Some(storage) => {
            let mut requests = BTreeMap::new();
            requests.insert("storage".to_string(), Quantity(storage.size.clone()));
            Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("data".to_string()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    storage_class_name: storage.class.clone(),
                    resources: Some(ResourceRequirements {
                        requests: Some(requests),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }])
        }
        None => {
            volumes.push(Volume {
                name: "data".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
            None
        }
    };

    let mut meta = metadata(cluster, statefulset_name(&name, ordinal), labels.clone());
    if !annotations.is_empty() {
        meta.annotations = Some(annotations);
    }

    StatefulSet {
        metadata: meta,
        spec: Some(StatefulSetSpec {
            replicas: Some(cluster.spec.cluster_replicas + 1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            service_name: headless_service_name(&name, ordinal),
            pod_management_policy: Some("Parallel".to_string()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![redis_container(cluster)],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            volume_claim_templates: claims,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// At most one pod of a group may be disrupted voluntarily.
pub fn pod_disruption_budget(cluster: &DistributedRedisCluster, ordinal: usize) -> PodDisruptionBudget {
    let name = cluster.name_any();
    let labels = group_labels(&name, ordinal);
    PodDisruptionBudget {
        metadata: metadata(cluster, pdb_name(&name, ordinal), labels.clone()),
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(1)),
            selector: Some(LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn redis_ports() -> Vec<ServicePort> {
    vec![
        ServicePort {
            name: Some("client".to_string()),
            port: REDIS_PORT,
            ..Default::default()
        },
        ServicePort {
            name: Some("gossip".to_string()),
            port: REDIS_BUS_PORT,
            ..Default::default()
        },
    ]
}

/// Headless service giving the pods of group `ordinal` stable DNS names.
pub fn headless_service(cluster: &DistributedRedisCluster, ordinal: usize) -> Service {
    let name = cluster.name_any();
    let labels = group_labels(&name, ordinal);
    Service {
        metadata: metadata(cluster, headless_service_name(&name, ordinal), labels.clone()),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(labels),
            ports: Some(redis_ports()),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Client-facing service over every node of the cluster.
pub fn client_service(cluster: &DistributedRedisCluster) -> Service {
    let name = cluster.name_any();
    let svc_name = if cluster.spec.service_name.is_empty() {
        name.clone()
    } else {
        cluster.spec.service_name.clone()
    };
    Service {
        metadata: metadata(cluster, svc_name, common_labels(&name)),
        spec: Some(ServiceSpec {
            selector: Some(common_labels(&name)),
            ports: Some(redis_ports()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Whether `existing` differs from `desired` in a way that rolls the pods.
pub fn statefulset_changed(existing: &StatefulSet, desired: &StatefulSet) -> bool {
    let replicas = |s: &StatefulSet| s.spec.as_ref().and_then(|s| s.replicas);
    let container = |s: &StatefulSet| {
        s.spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.iter().find(|c| c.name == CONTAINER_NAME).cloned())
    };
    let (old, new) = (container(existing), container(desired));
    replicas(existing) != replicas(desired)
        || old.as_ref().and_then(|c| c.image.clone()) != new.as_ref().and_then(|c| c.image.clone())
        || old.as_ref().and_then(|c| c.resources.clone()) != new.as_ref().and_then(|c| c.resources.clone())
}
