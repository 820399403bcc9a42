// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Long-running workload control on a cluster
//!
//! A bot is one single-replica deployment plus its config objects and a
//! NodePort service for the API. The deployment is what keeps the driver
//! stateless: stop scales to zero, start scales back up, restart deletes
//! the pod and lets the controller recreate it. The cluster's own
//! scheduler does the placement — this driver never picks nodes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use futures::AsyncBufReadExt;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use quantflow::error::{Error, ErrorKind, Result};
use quantflow::logs::{LogEntry, LogOptions, LogSource, LogStream};
use quantflow::naming::{bot_labels, bot_object_name, LABEL_BOT_ID, LABEL_MANAGED};
use quantflow::status::{ResourceUsage, WorkloadState, WorkloadStatus};
use quantflow::workload::{BotSpec, SubstrateHandle, WorkloadId, WorkloadUpdate};
use quantflow::{OpCtx, SubstrateKind, WorkloadController};

use crate::client::{is_not_found, kube_err, KubeClient, STOP_GRACE_SECS};
use crate::metrics;
use crate::objects::{
    build_api_service, build_bot_deployment, build_bot_pod_spec, build_config_map,
    build_strategy_chunks, chunk_strategy_source, resource_requirements, sanitized_labels,
};

/// Cluster implementation of [`WorkloadController`].
pub struct KubeWorkloads {
    client: KubeClient,
    http: reqwest::Client,
}

impl KubeWorkloads {
    /// Driver over an established cluster connection.
    #[must_use]
    pub fn new(client: KubeClient) -> Self {
        Self { client, http: reqwest::Client::new() }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.client(), self.client.namespace())
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.client(), self.client.namespace())
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.client(), self.client.namespace())
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.client(), self.client.namespace())
    }

    fn id_selector(id: &WorkloadId) -> String {
        format!("{LABEL_BOT_ID}={id}")
    }

    /// The workload's current pod, if the deployment has one.
    async fn find_pod(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<Option<Pod>> {
        let params = ListParams::default().labels(&Self::id_selector(id));
        let pods = ctx
            .guard("find-pod", self.pods().list(&params))
            .await?
            .map_err(|e| kube_err("find-pod", e))?;
        Ok(pods.items.into_iter().next())
    }

    /// Remove every artifact belonging to a workload. Missing objects are
    /// fine.
    async fn remove_artifacts(&self, ctx: &OpCtx, id: &WorkloadId, object: &str) {
        let selector = Self::id_selector(id);
        let params = ListParams::default().labels(&selector);
        if let Ok(Ok(maps)) = ctx.guard("delete", self.config_maps().list(&params)).await {
            for map in maps.items {
                if let Some(name) = map.metadata.name {
                    if let Err(e) = self.config_maps().delete(&name, &DeleteParams::default()).await
                    {
                        if !is_not_found(&e) {
                            warn!(workload = %id, object = %name, error = %e, "failed to delete config object");
                        }
                    }
                }
            }
        }
        if let Err(e) = self.services().delete(object, &DeleteParams::default()).await {
            if !is_not_found(&e) {
                warn!(workload = %id, error = %e, "failed to delete API service");
            }
        }
    }

    async fn get_deployment(&self, ctx: &OpCtx, operation: &str, id: &WorkloadId) -> Result<Deployment> {
        let name = bot_object_name(id);
        let found = ctx.guard(operation, self.deployments().get_opt(&name)).await?;
        found
            .map_err(|e| kube_err(operation, e))?
            .ok_or_else(|| Error::not_found(operation, name).with_workload(*id))
    }

    async fn scale(&self, ctx: &OpCtx, operation: &str, id: &WorkloadId, replicas: i32) -> Result<()> {
        let name = bot_object_name(id);
        let patch = json!({"spec": {"replicas": replicas}});
        let patched = ctx
            .guard(
                operation,
                self.deployments().patch(&name, &PatchParams::default(), &Patch::Merge(&patch)),
            )
            .await?;
        match patched {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                Err(Error::not_found(operation, name).with_workload(*id))
            }
            Err(e) => Err(kube_err(operation, e).with_workload(*id)),
        }
    }

    async fn status_of(&self, ctx: &OpCtx, deployment: &Deployment, id: WorkloadId) -> Result<WorkloadStatus> {
        let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        let pod = self.find_pod(ctx, &id).await?;

        let (state, healthy, pod_name, ip, started_at) = match &pod {
            None => {
                let state =
                    if desired == 0 { WorkloadState::Stopped } else { WorkloadState::Creating };
                (state, false, None, None, None)
            }
            Some(pod) => summarize_pod(pod),
        };

        let usage = match (&pod_name, self.client.config().metrics_endpoint.as_ref()) {
            (Some(pod_name), Some(endpoint))
                if matches!(state, WorkloadState::Running | WorkloadState::Unhealthy) =>
            {
                metrics::pod_usage(&self.http, endpoint, self.client.namespace(), pod_name)
                    .await
                    .unwrap_or_default()
            }
            _ => ResourceUsage::default(),
        };

        // Host-side port comes from the NodePort service.
        let host_port = {
            let service = ctx
                .guard("get-status", self.services().get_opt(&bot_object_name(&id)))
                .await?
                .map_err(|e| kube_err("get-status", e))?;
            service.and_then(|service| {
                service.spec.and_then(|spec| {
                    spec.ports
                        .and_then(|ports| ports.into_iter().next())
                        .and_then(|port| port.node_port)
                        .and_then(|p| u16::try_from(p).ok())
                })
            })
        };

        let error = pod.as_ref().and_then(waiting_error);

        Ok(WorkloadStatus {
            id,
            state,
            handle: pod
                .as_ref()
                .and_then(|p| p.metadata.uid.clone())
                .map(SubstrateHandle::new),
            healthy,
            last_seen: Utc::now(),
            usage,
            ip_address: ip,
            host_port,
            error,
            created_at: deployment.metadata.creation_timestamp.as_ref().map(|t| t.0),
            started_at,
            stopped_at: None,
        })
    }
}

/// Reduce a pod to the workload-status fields.
fn summarize_pod(
    pod: &Pod,
) -> (WorkloadState, bool, Option<String>, Option<String>, Option<chrono::DateTime<Utc>>) {
    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("Unknown");
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    let oom_killed = status
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses.iter().any(|cs| {
                cs.last_state
                    .as_ref()
                    .and_then(|s| s.terminated.as_ref())
                    .and_then(|t| t.reason.as_deref())
                    == Some("OOMKilled")
            })
        })
        .unwrap_or(false);

    let state = if oom_killed {
        WorkloadState::Error
    } else {
        match phase {
            "Pending" => WorkloadState::Creating,
            "Running" if ready => WorkloadState::Running,
            "Running" => WorkloadState::Unhealthy,
            "Succeeded" => WorkloadState::Stopped,
            "Failed" => WorkloadState::Error,
            _ => WorkloadState::Stopped,
        }
    };

    (
        state,
        matches!(state, WorkloadState::Running),
        pod.metadata.name.clone(),
        status.and_then(|s| s.pod_ip.clone()),
        status.and_then(|s| s.start_time.as_ref()).map(|t| t.0),
    )
}

/// Surface scheduling or image failures out of the pod's waiting states.
fn waiting_error(pod: &Pod) -> Option<String> {
    pod.status.as_ref().and_then(|status| {
        status.container_statuses.as_ref().and_then(|statuses| {
            statuses.iter().find_map(|cs| {
                cs.state.as_ref().and_then(|state| {
                    state.waiting.as_ref().and_then(|waiting| {
                        let reason = waiting.reason.as_deref()?;
                        if reason == "ContainerCreating" {
                            return None;
                        }
                        Some(match &waiting.message {
                            Some(message) => format!("{reason}: {message}"),
                            None => reason.to_string(),
                        })
                    })
                })
            })
        })
    })
}

#[async_trait]
impl WorkloadController for KubeWorkloads {
    async fn create(&self, ctx: &OpCtx, spec: &BotSpec) -> Result<SubstrateHandle> {
        spec.validate()?;
        let object = bot_object_name(&spec.id);
        let namespace = self.client.namespace();
        let labels: BTreeMap<String, String> =
            sanitized_labels(bot_labels(&spec.id, &spec.name).into_iter().collect());

        let chunk_count = chunk_strategy_source(&spec.strategy_code).len();
        let config_map = build_config_map(&object, namespace, &labels, spec);
        let chunks = build_strategy_chunks(&object, namespace, &labels, &spec.strategy_code);
        let service = build_api_service(&object, namespace, &labels, spec.api_port);
        let pod_spec = build_bot_pod_spec(&object, spec, chunk_count);
        let deployment = build_bot_deployment(&object, namespace, &labels, pod_spec);

        let unwind = |e: Error| async {
            self.remove_artifacts(ctx, &spec.id, &object).await;
            e.with_workload(spec.id)
        };

        let created = ctx
            .guard("create", self.config_maps().create(&PostParams::default(), &config_map))
            .await?;
        if let Err(e) = created {
            return Err(unwind(kube_err("create", e)).await);
        }
        for chunk in &chunks {
            let created =
                ctx.guard("create", self.config_maps().create(&PostParams::default(), chunk)).await?;
            if let Err(e) = created {
                return Err(unwind(kube_err("create", e)).await);
            }
        }
        let created =
            ctx.guard("create", self.services().create(&PostParams::default(), &service)).await?;
        if let Err(e) = created {
            return Err(unwind(kube_err("create", e)).await);
        }

        let created = ctx
            .guard("create", self.deployments().create(&PostParams::default(), &deployment))
            .await?;
        match created {
            Ok(created) => {
                info!(workload = %spec.id, object = %object, chunks = chunk_count, "workload deployed");
                Ok(SubstrateHandle::new(created.metadata.uid.unwrap_or(object)))
            }
            Err(e) => Err(unwind(kube_err("create", e)).await),
        }
    }

    async fn delete(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        let object = bot_object_name(id);
        let deleted = ctx
            .guard("delete", self.deployments().delete(&object, &DeleteParams::default()))
            .await?;
        match deleted {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(kube_err("delete", e).with_workload(*id)),
        }
        self.remove_artifacts(ctx, id, &object).await;
        debug!(workload = %id, "workload deleted");
        Ok(())
    }

    async fn start(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        self.scale(ctx, "start", id, 1).await
    }

    async fn stop(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        self.scale(ctx, "stop", id, 0).await?;
        // Grace is enforced by the pod's termination, driven by the
        // controller; nothing to await here beyond the scale request.
        Ok(())
    }

    async fn restart(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        // Confirm the workload exists so restart on a missing workload is
        // a not-found, matching the other substrates.
        self.get_deployment(ctx, "restart", id).await?;
        if let Some(pod) = self.find_pod(ctx, id).await? {
            if let Some(name) = pod.metadata.name {
                let params = DeleteParams::default().grace_period(u32::from(STOP_GRACE_SECS));
                let deleted = ctx.guard("restart", self.pods().delete(&name, &params)).await?;
                match deleted {
                    Ok(_) => {}
                    Err(e) if is_not_found(&e) => {}
                    Err(e) => return Err(kube_err("restart", e).with_workload(*id)),
                }
            }
        }
        Ok(())
    }

    async fn status(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<WorkloadStatus> {
        let deployment = self.get_deployment(ctx, "get-status", id).await?;
        self.status_of(ctx, &deployment, *id).await.map_err(|e| e.with_workload(*id))
    }

    async fn workload_ip(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<Option<String>> {
        Ok(self.find_pod(ctx, id).await?.and_then(|pod| pod.status.and_then(|s| s.pod_ip)))
    }

    async fn logs(&self, ctx: &OpCtx, id: &WorkloadId, options: LogOptions) -> Result<LogStream> {
        let pod = self
            .find_pod(ctx, id)
            .await?
            .and_then(|pod| pod.metadata.name)
            .ok_or_else(|| Error::not_found("get-logs", bot_object_name(id)).with_workload(*id))?;

        let params = LogParams {
            follow: options.follow,
            tail_lines: options.tail.map(|n| n as i64),
            timestamps: options.timestamps,
            since_seconds: options
                .since
                .map(|since| (Utc::now() - since).num_seconds().max(0)),
            container: Some("workload".to_string()),
            ..Default::default()
        };

        let cancel = CancellationToken::new();
        let (byte_tx, byte_rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes>>(64);
        let (entry_tx, entry_rx) = tokio::sync::mpsc::channel::<LogEntry>(256);
        let pods = self.pods();
        let task_cancel = cancel.clone();

        let stream = ctx
            .guard("get-logs", pods.log_stream(&pod, &params))
            .await?
            .map_err(|e| kube_err("get-logs", e).with_workload(*id))?;

        tokio::spawn(async move {
            let mut lines = stream.lines();
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    line = lines.next() => match line {
                        Some(Ok(line)) => {
                            let entry = LogEntry {
                                source: LogSource::Stdout,
                                message: line.clone(),
                                timestamp: None,
                            };
                            let _ = entry_tx.send(entry).await;
                            let mut bytes = line.into_bytes();
                            bytes.push(b'\n');
                            if byte_tx.send(Ok(bytes.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = byte_tx
                                .send(Err(Error::new("get-logs", ErrorKind::Io(e))))
                                .await;
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(LogStream::new(Box::pin(ReceiverStream::new(byte_rx)), cancel).with_entries(entry_rx))
    }

    async fn update(&self, ctx: &OpCtx, id: &WorkloadId, update: &WorkloadUpdate) -> Result<()> {
        if update.image.is_some() {
            return Err(Error::new(
                "update",
                ErrorKind::Validation("image changes require recreating the workload".to_string()),
            )
            .with_workload(*id));
        }
        let Some(limits) = update.limits else { return Ok(()) };
        self.get_deployment(ctx, "update", id).await?;

        let resources = resource_requirements(&limits);
        let patch = json!({
            "spec": {"template": {"spec": {"containers": [{
                "name": "workload",
                "resources": resources,
            }]}}}
        });
        let name = bot_object_name(id);
        ctx.guard(
            "update",
            self.deployments().patch(&name, &PatchParams::default(), &Patch::Strategic(&patch)),
        )
        .await?
        .map_err(|e| kube_err("update", e).with_workload(*id))?;
        Ok(())
    }

    async fn list(&self, ctx: &OpCtx) -> Result<Vec<WorkloadStatus>> {
        let params = ListParams::default().labels(&format!("{LABEL_MANAGED}=true"));
        let deployments = ctx
            .guard("list", self.deployments().list(&params))
            .await?
            .map_err(|e| kube_err("list", e))?;

        let mut statuses = Vec::new();
        for deployment in deployments.items {
            let Some(id) = deployment
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(LABEL_BOT_ID))
                .and_then(|raw| raw.parse::<WorkloadId>().ok())
            else {
                continue;
            };
            statuses.push(self.status_of(ctx, &deployment, id).await?);
        }
        Ok(statuses)
    }

    async fn health_check(&self, ctx: &OpCtx) -> Result<()> {
        self.client.health_check(ctx).await
    }

    async fn close(&self) -> Result<()> {
        self.client.close().await
    }

    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Kubernetes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    fn pod_with(phase: &str, ready: bool) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                pod_ip: Some("10.42.0.17".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pod_phases_map_onto_workload_states() {
        let (state, healthy, ..) = summarize_pod(&pod_with("Running", true));
        assert_eq!(state, WorkloadState::Running);
        assert!(healthy);

        let (state, healthy, ..) = summarize_pod(&pod_with("Running", false));
        assert_eq!(state, WorkloadState::Unhealthy);
        assert!(!healthy);

        let (state, ..) = summarize_pod(&pod_with("Pending", false));
        assert_eq!(state, WorkloadState::Creating);

        let (state, ..) = summarize_pod(&pod_with("Failed", false));
        assert_eq!(state, WorkloadState::Error);

        let (state, ..) = summarize_pod(&pod_with("Succeeded", false));
        assert_eq!(state, WorkloadState::Stopped);
    }

    #[test]
    fn pod_ip_is_surfaced() {
        let (.., ip, _) = summarize_pod(&pod_with("Running", true));
        assert_eq!(ip.as_deref(), Some("10.42.0.17"));
    }
}
