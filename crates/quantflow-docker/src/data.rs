// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Historical-data download tasks on a container daemon
//!
//! The composed download script runs inside a one-shot container on the
//! runner's substrate; downloaded candles land in the shared data volume
//! and the packaged archive leaves through the presigned PUT URL. Status
//! is derived entirely from the container state plus the phase lines and
//! sentinel-bracketed manifest in its logs — the driver itself stays
//! stateless.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, HostConfig, Mount, MountTypeEnum};
use tracing::{debug, info, warn};

use quantflow::download::{compose_script, parse_available_data, parse_progress};
use quantflow::error::Error;
use quantflow::error::Result;
use quantflow::jobs::DataDownloadSpec;
use quantflow::layout;
use quantflow::logs::{LogOptions, LogStream};
use quantflow::naming::{download_object_name, job_labels, TaskType, LABEL_JOB_ID};
use quantflow::runner::DownloadState;
use quantflow::workload::WorkloadId;
use quantflow::{DataDownloadController, DownloadStatus, DownloadTaskId, OpCtx, SubstrateKind};

use crate::client::{docker_err, is_not_found, DockerClient, STOP_GRACE_SECS};
use crate::jobs::SHARED_DATA_VOLUME;
use crate::logstream;

/// Label carrying the task's exchange count, read back for progress.
const LABEL_EXCHANGE_COUNT: &str = "quantflow.download.exchanges";

/// Container-daemon implementation of [`DataDownloadController`].
pub struct DockerDataDownloads {
    client: DockerClient,
}

impl DockerDataDownloads {
    /// Driver over an established daemon connection.
    #[must_use]
    pub fn new(client: DockerClient) -> Self {
        Self { client }
    }

    fn task_workload_id(task: &DownloadTaskId) -> Result<WorkloadId> {
        task.as_str().parse().map_err(|_| {
            Error::validation("download-task", format!("malformed task id '{task}'"))
        })
    }

    async fn resolve(&self, ctx: &OpCtx, task: &DownloadTaskId) -> Result<Option<String>> {
        let id = Self::task_workload_id(task)?;
        self.client
            .find_container(ctx, &download_object_name(&id), LABEL_JOB_ID, &id.to_string())
            .await
    }

    async fn resolve_required(
        &self,
        ctx: &OpCtx,
        operation: &str,
        task: &DownloadTaskId,
    ) -> Result<String> {
        self.resolve(ctx, task).await?.ok_or_else(|| {
            Error::not_found(operation, task.to_string())
        })
    }
}

#[async_trait]
impl DataDownloadController for DockerDataDownloads {
    async fn start_download(&self, ctx: &OpCtx, spec: &DataDownloadSpec) -> Result<DownloadTaskId> {
        let script = compose_script(spec)?;
        let name = download_object_name(&spec.id);

        let mut labels = job_labels(&spec.id, TaskType::DataDownload);
        labels.insert(LABEL_EXCHANGE_COUNT.to_string(), spec.exchanges.len().to_string());

        let config = Config {
            image: Some(spec.image.clone()),
            // The workload image's entrypoint is its own binary; the
            // download runs as a shell script instead.
            entrypoint: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            cmd: Some(vec![script]),
            labels: Some(labels),
            host_config: Some(HostConfig {
                mounts: Some(vec![Mount {
                    target: Some(layout::data_dir()),
                    source: Some(SHARED_DATA_VOLUME.to_string()),
                    typ: Some(MountTypeEnum::VOLUME),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions { name: name.clone(), platform: None };
        ctx.guard("start-download", self.client.docker().create_container(Some(options), config))
            .await?
            .map_err(|e| docker_err("start-download", e).with_workload(spec.id))?;

        let started = ctx
            .guard(
                "start-download",
                self.client.docker().start_container(&name, None::<StartContainerOptions<String>>),
            )
            .await
            .and_then(|r| r.map_err(|e| docker_err("start-download", e)));
        if let Err(e) = started {
            let remove = RemoveContainerOptions { force: true, v: true, ..Default::default() };
            if let Err(remove_err) = self.client.docker().remove_container(&name, Some(remove)).await
            {
                warn!(task = %spec.id, error = %remove_err, "failed to unwind download container");
            }
            return Err(e.with_workload(spec.id));
        }

        info!(task = %spec.id, exchanges = spec.exchanges.len(), "data download started");
        Ok(DownloadTaskId::new(spec.id.to_string()))
    }

    async fn status(&self, ctx: &OpCtx, task: &DownloadTaskId) -> Result<DownloadStatus> {
        let Some(container) = self.resolve(ctx, task).await? else {
            return Ok(DownloadStatus { state: DownloadState::Idle, ..Default::default() });
        };

        let details = ctx
            .guard(
                "get-status",
                self.client.docker().inspect_container(&container, None::<InspectContainerOptions>),
            )
            .await?
            .map_err(|e| docker_err("get-status", e))?;
        let state = details.state.unwrap_or_default();

        let exchange_total = details
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|labels| labels.get(LABEL_EXCHANGE_COUNT))
            .and_then(|raw| raw.parse::<u32>().ok())
            .unwrap_or(0);

        let logs =
            logstream::collect(&self.client, ctx, &container, &LogOptions::capture_all()).await?;
        let progress = parse_progress(&logs, exchange_total);

        match state.status {
            Some(ContainerStateStatusEnum::RUNNING)
            | Some(ContainerStateStatusEnum::CREATED)
            | Some(ContainerStateStatusEnum::RESTARTING) => Ok(DownloadStatus {
                state: DownloadState::Downloading,
                progress,
                error: None,
                available: None,
            }),
            _ => {
                let exit_code = state.exit_code.unwrap_or(-1);
                if exit_code == 0 {
                    let available = parse_available_data(&logs)?;
                    Ok(DownloadStatus {
                        state: DownloadState::Completed,
                        progress,
                        error: None,
                        available,
                    })
                } else {
                    let tail: Vec<&str> = logs.lines().rev().take(5).collect();
                    Ok(DownloadStatus {
                        state: DownloadState::Failed,
                        progress,
                        error: Some(format!(
                            "download exited with status {exit_code}: {}",
                            tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
                        )),
                        available: None,
                    })
                }
            }
        }
    }

    async fn logs(
        &self,
        ctx: &OpCtx,
        task: &DownloadTaskId,
        options: LogOptions,
    ) -> Result<LogStream> {
        let container = self.resolve_required(ctx, "get-logs", task).await?;
        Ok(logstream::open(&self.client, &container, &options))
    }

    async fn cancel(&self, ctx: &OpCtx, task: &DownloadTaskId) -> Result<()> {
        let container = self.resolve_required(ctx, "cancel", task).await?;
        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        ctx.guard("cancel", self.client.docker().stop_container(&container, Some(options)))
            .await?
            .map_err(|e| docker_err("cancel", e))?;
        debug!(task = %task, "download cancelled");
        Ok(())
    }

    async fn cleanup(&self, ctx: &OpCtx, task: &DownloadTaskId) -> Result<()> {
        if let Some(container) = self.resolve(ctx, task).await? {
            let remove = RemoveContainerOptions { force: true, v: false, ..Default::default() };
            let removed = ctx
                .guard("cleanup", self.client.docker().remove_container(&container, Some(remove)))
                .await?;
            match removed {
                Ok(()) => {}
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(docker_err("cleanup", e)),
            }
        }
        Ok(())
    }

    async fn health_check(&self, ctx: &OpCtx) -> Result<()> {
        self.client.health_check(ctx).await
    }

    async fn close(&self) -> Result<()> {
        self.client.close().await
    }

    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Docker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_workload_uuids() {
        let task = DownloadTaskId::new("6e0fb9a2-44f5-4b5a-9c6e-0a4f6f8f2b11");
        let id = DockerDataDownloads::task_workload_id(&task).unwrap();
        assert_eq!(download_object_name(&id), format!("quantflow-data-{id}"));

        let bad = DownloadTaskId::new("not-a-uuid");
        assert!(DockerDataDownloads::task_workload_id(&bad).is_err());
    }
}
