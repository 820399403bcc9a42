// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Cluster object construction
//!
//! Config layers become config objects the workload pod mounts as files.
//! Cluster config objects cap out around 1 MiB, and strategy source is
//! occasionally generated far beyond that, so the source is chunked across
//! numbered objects and reassembled by an init container — the workload
//! sees a single file.
//!
//! Every label value passes through the label-value sanitizer; object
//! names derive from workload UUIDs and are RFC 1123 safe by
//! construction.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, PodSpec,
    PodTemplateSpec, ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use quantflow::layout;
use quantflow::naming::LABEL_BOT_ID;
use quantflow::sanitize::label_value;
use quantflow::workload::{BotSpec, ConfigLayerKind, ResourceLimits, WorkloadId};

/// Maximum bytes of strategy source per config object, leaving headroom
/// under the cluster's object size limit.
pub const STRATEGY_CHUNK_BYTES: usize = 900 * 1024;

/// Mount point of the config-layer object inside init containers.
pub const CONFIG_LAYERS_MOUNT: &str = "/quantflow/config-layers";

/// Mount point of the strategy-chunk objects inside init containers.
pub const STRATEGY_CHUNKS_MOUNT: &str = "/quantflow/strategy-chunks";

/// Name of the writable user-data volume shared by init and main
/// containers.
pub const USERDATA_VOLUME: &str = "userdata";

/// Sanitize a label map in place; keys are fixed constants, values are
/// user-influenced.
#[must_use]
pub fn sanitized_labels(labels: std::collections::HashMap<String, String>) -> BTreeMap<String, String> {
    labels.into_iter().map(|(k, v)| (k, label_value(&v))).collect()
}

/// Name of the config-layer object of a bot.
#[must_use]
pub fn config_object_name(object: &str) -> String {
    format!("{object}-config")
}

/// Name of one strategy chunk object.
#[must_use]
pub fn strategy_chunk_name(object: &str, index: usize) -> String {
    format!("{object}-strategy-{index:03}")
}

/// Split strategy source into object-sized chunks. Always yields at least
/// one chunk so the reassembly path is uniform.
#[must_use]
pub fn chunk_strategy_source(source: &str) -> Vec<String> {
    if source.len() <= STRATEGY_CHUNK_BYTES {
        return vec![source.to_string()];
    }
    let bytes = source.as_bytes();
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < bytes.len() {
        let mut end = (start + STRATEGY_CHUNK_BYTES).min(bytes.len());
        // Never split inside a UTF-8 sequence.
        while end < bytes.len() && (bytes[end] & 0b1100_0000) == 0b1000_0000 {
            end -= 1;
        }
        chunks.push(String::from_utf8_lossy(&bytes[start..end]).into_owned());
        start = end;
    }
    chunks
}

/// The config-layer object: one file per layer, in contract naming.
#[must_use]
pub fn build_config_map(
    object: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    spec: &BotSpec,
) -> ConfigMap {
    let mut data = BTreeMap::new();
    for (kind, layer) in spec.config.ordered() {
        let rendered = serde_json::to_string_pretty(&serde_json::Value::Object(layer.clone()))
            .unwrap_or_else(|_| "{}".to_string());
        data.insert(kind.file_name().to_string(), rendered);
    }
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_object_name(object)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// The numbered strategy-chunk objects.
#[must_use]
pub fn build_strategy_chunks(
    object: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    source: &str,
) -> Vec<ConfigMap> {
    chunk_strategy_source(source)
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| ConfigMap {
            metadata: ObjectMeta {
                name: Some(strategy_chunk_name(object, index)),
                namespace: Some(namespace.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("part".to_string(), chunk)])),
            ..Default::default()
        })
        .collect()
}

/// Shell run by the init container: copy config layers and reassemble the
/// strategy source into the writable user-data volume.
#[must_use]
pub fn materialize_script(id: &WorkloadId, strategy_file: &str) -> String {
    let bot_dir = layout::bot_dir(id);
    format!(
        "mkdir -p {bot_dir}/strategies && \
         cp {CONFIG_LAYERS_MOUNT}/*.json {bot_dir}/ && \
         cat {STRATEGY_CHUNKS_MOUNT}/*/part > {bot_dir}/strategies/{strategy_file}"
    )
}

/// Resource limits in cluster quantity form.
#[must_use]
pub fn resource_requirements(limits: &ResourceLimits) -> Option<ResourceRequirements> {
    let mut map = BTreeMap::new();
    if let Some(memory) = limits.memory_bytes {
        map.insert("memory".to_string(), Quantity(memory.to_string()));
    }
    if let Some(cpus) = limits.cpus {
        map.insert("cpu".to_string(), Quantity(format!("{}m", (cpus * 1000.0) as i64)));
    }
    if map.is_empty() {
        None
    } else {
        Some(ResourceRequirements { limits: Some(map), ..Default::default() })
    }
}

/// The pod spec of a bot workload.
#[must_use]
pub fn build_bot_pod_spec(object: &str, spec: &BotSpec, chunk_count: usize) -> PodSpec {
    let mut volumes = vec![
        Volume {
            name: USERDATA_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: "config-layers".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_object_name(object),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    let mut init_mounts = vec![
        VolumeMount {
            name: USERDATA_VOLUME.to_string(),
            mount_path: layout::USER_DATA_DIR.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "config-layers".to_string(),
            mount_path: CONFIG_LAYERS_MOUNT.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ];
    for index in 0..chunk_count {
        let volume_name = format!("strategy-chunk-{index:03}");
        volumes.push(Volume {
            name: volume_name.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: strategy_chunk_name(object, index),
                ..Default::default()
            }),
            ..Default::default()
        });
        init_mounts.push(VolumeMount {
            name: volume_name,
            mount_path: format!("{STRATEGY_CHUNKS_MOUNT}/{index:03}"),
            read_only: Some(true),
            ..Default::default()
        });
    }

    let env: Vec<EnvVar> = spec
        .env
        .iter()
        .map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()), ..Default::default() })
        .collect();

    PodSpec {
        init_containers: Some(vec![Container {
            name: "materialize".to_string(),
            image: Some("busybox:stable".to_string()),
            command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            args: Some(vec![materialize_script(&spec.id, &spec.strategy_file_name())]),
            volume_mounts: Some(init_mounts),
            ..Default::default()
        }]),
        containers: vec![Container {
            name: "workload".to_string(),
            image: Some(spec.image.clone()),
            args: Some(layout::trade_command(spec)),
            env: if env.is_empty() { None } else { Some(env) },
            ports: Some(vec![k8s_openapi::api::core::v1::ContainerPort {
                container_port: i32::from(spec.api_port),
                name: Some("api".to_string()),
                ..Default::default()
            }]),
            resources: resource_requirements(&spec.limits),
            volume_mounts: Some(vec![VolumeMount {
                name: USERDATA_VOLUME.to_string(),
                mount_path: layout::USER_DATA_DIR.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }],
        volumes: Some(volumes),
        restart_policy: Some("Always".to_string()),
        ..Default::default()
    }
}

/// Wrap a bot pod spec into a single-replica deployment.
///
/// The deployment is what makes stop/start stateless for the driver:
/// stop scales to zero, start scales back to one, restart deletes the
/// pod and lets the controller recreate it.
#[must_use]
pub fn build_bot_deployment(
    object: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    pod_spec: PodSpec,
) -> Deployment {
    let selector: BTreeMap<String, String> = labels
        .iter()
        .filter(|(key, _)| key.as_str() == LABEL_BOT_ID)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Deployment {
        metadata: ObjectMeta {
            name: Some(object.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector { match_labels: Some(selector), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels.clone()), ..Default::default() }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// NodePort service publishing the workload API on a random host-side
/// port.
#[must_use]
pub fn build_api_service(
    object: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    api_port: u16,
) -> Service {
    let selector: BTreeMap<String, String> = labels
        .iter()
        .filter(|(key, _)| key.as_str() == LABEL_BOT_ID)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Service {
        metadata: ObjectMeta {
            name: Some(object.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("api".to_string()),
                port: i32::from(api_port),
                target_port: Some(IntOrString::Int(i32::from(api_port))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The config object of a one-shot job: the single merged config file.
#[must_use]
pub fn build_job_config_map(
    object: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    config_json: &str,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_object_name(object)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("config.json".to_string(), config_json.to_string())])),
        ..Default::default()
    }
}

/// Init-container shell for one-shot jobs: merged config plus reassembled
/// strategy source, under the flat user-data layout.
#[must_use]
pub fn job_materialize_script(strategy_file: &str) -> String {
    format!(
        "mkdir -p {userdata}/strategies && \
         cp {CONFIG_LAYERS_MOUNT}/config.json {userdata}/ && \
         cat {STRATEGY_CHUNKS_MOUNT}/*/part > {userdata}/strategies/{strategy_file}",
        userdata = layout::USER_DATA_DIR
    )
}

/// Claims mounted into a one-shot job pod.
pub struct JobClaims<'a> {
    /// Per-job results claim and its mount path inside the pod.
    pub results: (&'a str, String),
    /// Shared historical-data claim, mounted read-only.
    pub data: &'a str,
}

/// The pod spec of a one-shot job.
#[must_use]
pub fn build_job_pod_spec(
    object: &str,
    image: &str,
    command: Vec<String>,
    env: &std::collections::HashMap<String, String>,
    limits: &ResourceLimits,
    strategy_file: &str,
    chunk_count: usize,
    claims: &JobClaims<'_>,
) -> PodSpec {
    let mut volumes = vec![
        Volume {
            name: USERDATA_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: "config-layers".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_object_name(object),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "results".to_string(),
            persistent_volume_claim: Some(
                k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                    claim_name: claims.results.0.to_string(),
                    read_only: None,
                },
            ),
            ..Default::default()
        },
        Volume {
            name: "data".to_string(),
            persistent_volume_claim: Some(
                k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                    claim_name: claims.data.to_string(),
                    read_only: Some(true),
                },
            ),
            ..Default::default()
        },
    ];
    let mut init_mounts = vec![
        VolumeMount {
            name: USERDATA_VOLUME.to_string(),
            mount_path: layout::USER_DATA_DIR.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "config-layers".to_string(),
            mount_path: CONFIG_LAYERS_MOUNT.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ];
    for index in 0..chunk_count {
        let volume_name = format!("strategy-chunk-{index:03}");
        volumes.push(Volume {
            name: volume_name.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: strategy_chunk_name(object, index),
                ..Default::default()
            }),
            ..Default::default()
        });
        init_mounts.push(VolumeMount {
            name: volume_name,
            mount_path: format!("{STRATEGY_CHUNKS_MOUNT}/{index:03}"),
            read_only: Some(true),
            ..Default::default()
        });
    }

    let env_vars: Vec<EnvVar> = env
        .iter()
        .map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()), ..Default::default() })
        .collect();

    PodSpec {
        init_containers: Some(vec![Container {
            name: "materialize".to_string(),
            image: Some("busybox:stable".to_string()),
            command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            args: Some(vec![job_materialize_script(strategy_file)]),
            volume_mounts: Some(init_mounts),
            ..Default::default()
        }]),
        containers: vec![Container {
            name: "workload".to_string(),
            image: Some(image.to_string()),
            args: Some(command),
            env: if env_vars.is_empty() { None } else { Some(env_vars) },
            resources: resource_requirements(limits),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: USERDATA_VOLUME.to_string(),
                    mount_path: layout::USER_DATA_DIR.to_string(),
                    ..Default::default()
                },
                VolumeMount {
                    name: "results".to_string(),
                    mount_path: claims.results.1.clone(),
                    ..Default::default()
                },
                VolumeMount {
                    name: "data".to_string(),
                    mount_path: layout::data_dir(),
                    read_only: Some(true),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }],
        volumes: Some(volumes),
        restart_policy: Some("Never".to_string()),
        ..Default::default()
    }
}

/// Wrap a pod spec into a batch job that never retries and is not
/// garbage-collected on completion — the results claim must outlive the
/// run.
#[must_use]
pub fn build_job(
    object: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    pod_spec: PodSpec,
) -> k8s_openapi::api::batch::v1::Job {
    k8s_openapi::api::batch::v1::Job {
        metadata: ObjectMeta {
            name: Some(object.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(k8s_openapi::api::batch::v1::JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels.clone()), ..Default::default() }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_source_is_a_single_chunk() {
        let chunks = chunk_strategy_source("class S:\n    pass\n");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn chunking_round_trips_large_sources() {
        let source = "x".repeat(STRATEGY_CHUNK_BYTES * 2 + 1234);
        let chunks = chunk_strategy_source(&source);
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.len() <= STRATEGY_CHUNK_BYTES));
        assert_eq!(chunks.concat(), source);
    }

    #[test]
    fn chunking_respects_utf8_boundaries() {
        let source = "é".repeat(STRATEGY_CHUNK_BYTES); // 2 bytes each
        let chunks = chunk_strategy_source(&source);
        assert_eq!(chunks.concat(), source);
        for chunk in chunks {
            assert!(std::str::from_utf8(chunk.as_bytes()).is_ok());
        }
    }

    #[test]
    fn chunk_names_sort_with_their_mounts() {
        // Reassembly relies on lexicographic glob order, hence the
        // zero-padded indices.
        let names: Vec<String> =
            (0..12).map(|i| strategy_chunk_name("quantflow-bot-x", i)).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn config_map_carries_all_four_layers() {
        let spec = quantflow_testing::sample_bot_spec();
        let map = build_config_map("quantflow-bot-x", "trading", &BTreeMap::new(), &spec);
        let data = map.data.unwrap();
        for kind in ConfigLayerKind::ORDER {
            assert!(data.contains_key(kind.file_name()), "{} missing", kind.file_name());
        }
    }

    #[test]
    fn pod_spec_reassembles_before_the_workload_starts() {
        let spec = quantflow_testing::sample_bot_spec();
        let pod = build_bot_pod_spec("quantflow-bot-x", &spec, 2);

        let init = &pod.init_containers.as_ref().unwrap()[0];
        let script = &init.args.as_ref().unwrap()[0];
        assert!(script.contains("cat /quantflow/strategy-chunks/*/part"));
        assert!(script.contains(CONFIG_LAYERS_MOUNT));

        // Two chunk volumes plus userdata and config layers.
        assert_eq!(pod.volumes.as_ref().unwrap().len(), 4);
        let workload = &pod.containers[0];
        assert_eq!(workload.args.as_ref().unwrap()[0], "trade");
    }
}
