// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Cluster-resident volume access through helper pods
//!
//! The orchestrator never has filesystem access to a cluster volume, so
//! reads spawn a short-lived helper pod that mounts the claim and streams
//! the bytes back through its log channel. Cluster pod logs arrive as raw
//! bytes (no frame multiplexing), which keeps recovery a straight copy —
//! but the helper's stderr would still corrupt the payload, so helpers
//! redirect their own diagnostics to /dev/null.

use std::collections::BTreeMap;

use futures::AsyncReadExt;
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
    Pod, PodSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, LogParams, PostParams};
use kube::runtime::wait::await_condition;
use tracing::{debug, warn};

use quantflow::error::{Error, ErrorKind, Result};
use quantflow::naming::LABEL_MANAGED;
use quantflow::sanitize::shell_escape;
use quantflow::OpCtx;

use crate::client::{is_not_found, kube_err, KubeClient};

/// Image helper pods run. Provides `sh`, `cat` and `unzip`.
pub const HELPER_IMAGE: &str = "busybox:stable";

/// Where the claim is mounted inside helper pods.
const MOUNT_POINT: &str = "/work";

/// Default size requested for per-job result claims.
const DEFAULT_CLAIM_SIZE: &str = "1Gi";

/// Helper-pod access to cluster volumes.
#[derive(Clone)]
pub struct KubeVolumeHelper {
    client: KubeClient,
}

impl KubeVolumeHelper {
    /// Helper bound to one cluster connection.
    #[must_use]
    pub fn new(client: KubeClient) -> Self {
        Self { client }
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.client(), self.client.namespace())
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.client(), self.client.namespace())
    }

    /// Create a claim if it does not exist yet. Idempotent.
    pub async fn ensure_claim(&self, ctx: &OpCtx, name: &str) -> Result<()> {
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.client.namespace().to_string()),
                labels: Some(BTreeMap::from([(
                    LABEL_MANAGED.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(DEFAULT_CLAIM_SIZE.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = ctx
            .guard("ensure-claim", self.pvcs().create(&PostParams::default(), &claim))
            .await?;
        match created {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(()),
            Err(e) => Err(kube_err("ensure-claim", e)),
        }
    }

    /// Delete a claim. Missing claims are not an error.
    pub async fn remove_claim(&self, ctx: &OpCtx, name: &str) -> Result<()> {
        let deleted = ctx
            .guard("remove-claim", self.pvcs().delete(name, &DeleteParams::default()))
            .await?;
        match deleted {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(kube_err("remove-claim", e)),
        }
    }

    /// Read `path` (relative to the claim root) back as raw bytes.
    pub async fn read_file(&self, ctx: &OpCtx, claim: &str, path: &str) -> Result<Vec<u8>> {
        let target = join_mount(path)?;
        self.run(ctx, claim, &format!("cat {} 2>/dev/null", shell_escape(&target))).await
    }

    /// Extract one member of a zip archive stored in the claim.
    pub async fn read_file_from_zip(
        &self,
        ctx: &OpCtx,
        claim: &str,
        archive: &str,
        member: &str,
    ) -> Result<Vec<u8>> {
        let target = join_mount(archive)?;
        let script =
            format!("unzip -p {} {} 2>/dev/null", shell_escape(&target), shell_escape(member));
        self.run(ctx, claim, &script).await
    }

    /// Run one helper pod to completion and return its log bytes.
    async fn run(&self, ctx: &OpCtx, claim: &str, script: &str) -> Result<Vec<u8>> {
        let pods = self.pods();
        let name = format!("quantflow-helper-{}", uuid::Uuid::new_v4().simple());

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.client.namespace().to_string()),
                labels: Some(BTreeMap::from([(
                    LABEL_MANAGED.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                containers: vec![Container {
                    name: "helper".to_string(),
                    image: Some(HELPER_IMAGE.to_string()),
                    command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
                    args: Some(vec![script.to_string()]),
                    volume_mounts: Some(vec![VolumeMount {
                        name: "target".to_string(),
                        mount_path: MOUNT_POINT.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: "target".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim.to_string(),
                        read_only: Some(true),
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        ctx.guard("volume-helper", pods.create(&PostParams::default(), &pod))
            .await?
            .map_err(|e| kube_err("volume-helper", e))?;

        let outcome = self.collect(ctx, &pods, &name).await;

        if let Err(e) = pods.delete(&name, &DeleteParams::default()).await {
            if !is_not_found(&e) {
                warn!(helper = %name, error = %e, "failed to remove helper pod");
            }
        }
        outcome
    }

    /// Wait for the helper to finish, then stream its logs as bytes.
    /// No internal timeout; the caller's context bounds the wait.
    async fn collect(&self, ctx: &OpCtx, pods: &Api<Pod>, name: &str) -> Result<Vec<u8>> {
        let finished = await_condition(pods.clone(), name, pod_finished());
        ctx.guard("volume-helper", finished).await?.map_err(|e| {
            Error::new("volume-helper", ErrorKind::Other(format!("helper wait failed: {e}")))
        })?;

        let pod = ctx
            .guard("volume-helper", pods.get(name))
            .await?
            .map_err(|e| kube_err("volume-helper", e))?;
        let succeeded = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == "Succeeded");
        if !succeeded {
            return Err(Error::new(
                "volume-helper",
                ErrorKind::Other(format!("helper pod '{name}' did not succeed")),
            ));
        }

        let params = LogParams::default();
        let mut stream = ctx
            .guard("volume-helper", pods.log_stream(name, &params))
            .await?
            .map_err(|e| kube_err("volume-helper", e))?;
        let mut buf = Vec::new();
        ctx.guard("volume-helper", stream.read_to_end(&mut buf))
            .await?
            .map_err(|e| Error::new("volume-helper", ErrorKind::Io(e)))?;
        debug!(helper = %name, bytes = buf.len(), "helper read complete");
        Ok(buf)
    }
}

fn pod_finished() -> impl kube::runtime::wait::Condition<Pod> {
    |obj: Option<&Pod>| {
        obj.and_then(|pod| pod.status.as_ref())
            .and_then(|status| status.phase.as_deref())
            .is_some_and(|phase| phase == "Succeeded" || phase == "Failed")
    }
}

fn join_mount(path: &str) -> Result<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(Error::validation("volume-helper", "empty claim path"));
    }
    if trimmed.split('/').any(|part| part == "..") {
        return Err(Error::validation(
            "volume-helper",
            format!("path '{path}' escapes the claim"),
        ));
    }
    Ok(format!("{MOUNT_POINT}/{trimmed}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_paths_are_rooted_and_traversal_free() {
        assert_eq!(join_mount(".last_result.json").unwrap(), "/work/.last_result.json");
        assert!(join_mount("").is_err());
        assert!(join_mount("../secrets").is_err());
    }
}
