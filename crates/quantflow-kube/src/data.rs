// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Historical-data download tasks on a cluster
//!
//! The composed shell script runs as a batch job on the runner's cluster;
//! candles land in the shared data claim and the packaged archive leaves
//! through the presigned PUT URL. Progress and the availability manifest
//! are parsed out of the pod's logs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use tracing::{debug, info};

use quantflow::download::{compose_script, parse_available_data, parse_progress};
use quantflow::error::{Error, Result};
use quantflow::jobs::DataDownloadSpec;
use quantflow::layout;
use quantflow::logs::{LogOptions, LogStream};
use quantflow::naming::{download_object_name, job_labels, TaskType, LABEL_JOB_ID};
use quantflow::runner::DownloadState;
use quantflow::workload::WorkloadId;
use quantflow::{DataDownloadController, DownloadStatus, DownloadTaskId, OpCtx, SubstrateKind};

use crate::client::{is_not_found, kube_err, KubeClient};
use crate::jobs::SHARED_DATA_CLAIM;
use crate::objects::sanitized_labels;
use crate::volumes::KubeVolumeHelper;

/// Label carrying the task's exchange count, read back for progress.
const LABEL_EXCHANGE_COUNT: &str = "quantflow.download.exchanges";

/// Cluster implementation of [`DataDownloadController`].
pub struct KubeDataDownloads {
    client: KubeClient,
    helper: KubeVolumeHelper,
}

impl KubeDataDownloads {
    /// Driver over an established cluster connection.
    #[must_use]
    pub fn new(client: KubeClient) -> Self {
        let helper = KubeVolumeHelper::new(client.clone());
        Self { client, helper }
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.client(), self.client.namespace())
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.client(), self.client.namespace())
    }

    fn task_workload_id(task: &DownloadTaskId) -> Result<WorkloadId> {
        task.as_str().parse().map_err(|_| {
            Error::validation("download-task", format!("malformed task id '{task}'"))
        })
    }

    async fn find_job(&self, ctx: &OpCtx, task: &DownloadTaskId) -> Result<Option<Job>> {
        let id = Self::task_workload_id(task)?;
        ctx.guard("find-task", self.jobs().get_opt(&download_object_name(&id)))
            .await?
            .map_err(|e| kube_err("find-task", e))
    }

    async fn collect_pod_logs(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<String> {
        let params = ListParams::default().labels(&format!("{LABEL_JOB_ID}={id}"));
        let pods = ctx
            .guard("get-logs", self.pods().list(&params))
            .await?
            .map_err(|e| kube_err("get-logs", e))?;
        let Some(pod) = pods.items.into_iter().next().and_then(|p| p.metadata.name) else {
            return Ok(String::new());
        };
        ctx.guard("get-logs", self.pods().logs(&pod, &LogParams::default()))
            .await?
            .map_err(|e| kube_err("get-logs", e))
    }
}

#[async_trait]
impl DataDownloadController for KubeDataDownloads {
    async fn start_download(&self, ctx: &OpCtx, spec: &DataDownloadSpec) -> Result<DownloadTaskId> {
        let script = compose_script(spec)?;
        let object = download_object_name(&spec.id);
        let namespace = self.client.namespace();

        let mut labels: BTreeMap<String, String> =
            sanitized_labels(job_labels(&spec.id, TaskType::DataDownload).into_iter().collect());
        labels.insert(LABEL_EXCHANGE_COUNT.to_string(), spec.exchanges.len().to_string());

        self.helper.ensure_claim(ctx, SHARED_DATA_CLAIM).await?;

        let job = Job {
            metadata: ObjectMeta {
                name: Some(object.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::batch::v1::JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "download".to_string(),
                            image: Some(spec.image.clone()),
                            command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
                            args: Some(vec![script]),
                            volume_mounts: Some(vec![VolumeMount {
                                name: "data".to_string(),
                                mount_path: layout::data_dir(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        volumes: Some(vec![Volume {
                            name: "data".to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: SHARED_DATA_CLAIM.to_string(),
                                read_only: None,
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        ctx.guard("start-download", self.jobs().create(&PostParams::default(), &job))
            .await?
            .map_err(|e| kube_err("start-download", e).with_workload(spec.id))?;

        info!(task = %spec.id, exchanges = spec.exchanges.len(), "data download submitted");
        Ok(DownloadTaskId::new(spec.id.to_string()))
    }

    async fn status(&self, ctx: &OpCtx, task: &DownloadTaskId) -> Result<DownloadStatus> {
        let Some(job) = self.find_job(ctx, task).await? else {
            return Ok(DownloadStatus { state: DownloadState::Idle, ..Default::default() });
        };
        let id = Self::task_workload_id(task)?;

        let exchange_total = job
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_EXCHANGE_COUNT))
            .and_then(|raw| raw.parse::<u32>().ok())
            .unwrap_or(0);

        let logs = self.collect_pod_logs(ctx, &id).await?;
        let progress = parse_progress(&logs, exchange_total);

        let status = job.status.as_ref();
        let succeeded = status.and_then(|s| s.succeeded).unwrap_or(0);
        let failed = status.and_then(|s| s.failed).unwrap_or(0);

        if succeeded > 0 {
            let available = parse_available_data(&logs)?;
            Ok(DownloadStatus { state: DownloadState::Completed, progress, error: None, available })
        } else if failed > 0 {
            let tail: Vec<&str> = logs.lines().rev().take(5).collect();
            Ok(DownloadStatus {
                state: DownloadState::Failed,
                progress,
                error: Some(format!(
                    "download job failed: {}",
                    tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
                )),
                available: None,
            })
        } else {
            Ok(DownloadStatus {
                state: DownloadState::Downloading,
                progress,
                error: None,
                available: None,
            })
        }
    }

    async fn logs(
        &self,
        ctx: &OpCtx,
        task: &DownloadTaskId,
        _options: LogOptions,
    ) -> Result<LogStream> {
        // Download logs are short-lived and polled; serve a snapshot
        // stream rather than holding a follow connection open.
        let id = Self::task_workload_id(task)?;
        let logs = self.collect_pod_logs(ctx, &id).await?;
        let cancel = tokio_util::sync::CancellationToken::new();
        let bytes: quantflow::Result<bytes::Bytes> = Ok(bytes::Bytes::from(logs.into_bytes()));
        Ok(LogStream::new(Box::pin(futures::stream::iter(vec![bytes])), cancel))
    }

    async fn cancel(&self, ctx: &OpCtx, task: &DownloadTaskId) -> Result<()> {
        let Some(job) = self.find_job(ctx, task).await? else {
            return Err(Error::not_found("cancel", task.to_string()));
        };
        if let Some(name) = job.metadata.name {
            let deleted = ctx
                .guard("cancel", self.jobs().delete(&name, &DeleteParams::background()))
                .await?;
            match deleted {
                Ok(_) => {}
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(kube_err("cancel", e)),
            }
        }
        debug!(task = %task, "download cancelled");
        Ok(())
    }

    async fn cleanup(&self, ctx: &OpCtx, task: &DownloadTaskId) -> Result<()> {
        if let Some(job) = self.find_job(ctx, task).await? {
            if let Some(name) = job.metadata.name {
                let deleted = ctx
                    .guard("cleanup", self.jobs().delete(&name, &DeleteParams::background()))
                    .await?;
                match deleted {
                    Ok(_) => {}
                    Err(e) if is_not_found(&e) => {}
                    Err(e) => return Err(kube_err("cleanup", e)),
                }
            }
        }
        // The shared data claim stays; it is the runner's data store, not
        // per-task scratch.
        Ok(())
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

    #[test]
    fn task_ids_are_workload_uuids() {
        let task = DownloadTaskId::new("6e0fb9a2-44f5-4b5a-9c6e-0a4f6f8f2b11");
        assert!(KubeDataDownloads::task_workload_id(&task).is_ok());
        assert!(KubeDataDownloads::task_workload_id(&DownloadTaskId::new("nope")).is_err());
    }
}
