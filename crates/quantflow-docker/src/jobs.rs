// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! One-shot job control on a container daemon
//!
//! Backtests and hyperopts share the shape: a merged config file with the
//! dry-run guard injected, the strategy source, a shared read-only
//! historical-data volume and a per-job results volume. Jobs start with
//! auto-remove disabled — the exited container must persist so results can
//! be extracted from the results volume.
//!
//! Result extraction is two-stage: the volume-resident pointer file names
//! the archive of the most recent run, and the JSON member with the same
//! base name inside that archive holds the structured result. On a remote
//! daemon both stages run through helper containers; on a local daemon
//! the results directory is bind-mounted and read directly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, HostConfig, Mount, MountTypeEnum};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use quantflow::error::{Error, ErrorKind, Result};
use quantflow::jobs::{BacktestSpec, HyperoptSpec};
use quantflow::layout;
use quantflow::logs::{LogOptions, LogStream};
use quantflow::naming::{
    backtest_object_name, hyperopt_object_name, job_labels, TaskType, LABEL_JOB_ID, LABEL_MANAGED,
    LABEL_TASK_TYPE,
};
use quantflow::results::{BacktestResult, HyperoptResult};
use quantflow::status::{EpochProgress, JobState, JobStatus, ResourceUsage};
use quantflow::workload::{SubstrateHandle, WorkloadId, CPU_QUOTA_PERIOD_US};
use quantflow::{JobController, OpCtx, SubstrateKind};

use crate::client::{
    docker_err, is_not_found, parse_docker_time, DockerClient, STOP_GRACE_SECS,
};
use crate::logstream;
use crate::stats::usage_from_stats;
use crate::volumes::VolumeHelper;

/// Shared historical-data volume, populated by download tasks.
pub const SHARED_DATA_VOLUME: &str = "quantflow-data";

#[allow(clippy::unwrap_used)] // literal pattern
static EPOCH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)/(\d+)[:|]?\s").unwrap());

#[allow(clippy::unwrap_used)] // literal pattern
static OBJECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Objective:\s*(-?\d+(?:\.\d+)?)").unwrap());

/// Container-daemon implementation of [`JobController`].
pub struct DockerJobs {
    client: DockerClient,
    helper: VolumeHelper,
}

impl DockerJobs {
    /// Driver over an established daemon connection.
    #[must_use]
    pub fn new(client: DockerClient) -> Self {
        let helper = VolumeHelper::new(client.clone());
        Self { client, helper }
    }

    fn object_name(id: &WorkloadId, task: TaskType) -> String {
        match task {
            TaskType::Hyperopt => hyperopt_object_name(id),
            _ => backtest_object_name(id),
        }
    }

    fn userdata_volume(id: &WorkloadId, task: TaskType) -> String {
        format!("{}-userdata", Self::object_name(id, task))
    }

    fn results_volume(id: &WorkloadId, task: TaskType) -> String {
        format!("{}-results", Self::object_name(id, task))
    }

    fn results_scratch(&self, id: &WorkloadId) -> PathBuf {
        self.client.scratch_dir(&format!("jobs/{id}/results"))
    }

    fn results_mount_target(task: TaskType) -> String {
        match task {
            TaskType::Hyperopt => layout::hyperopt_results_dir(),
            _ => layout::backtest_results_dir(),
        }
    }

    /// Find the job container and its family: by deterministic names
    /// first, then by label.
    async fn resolve(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<Option<(String, TaskType)>> {
        for task in [TaskType::Backtest, TaskType::Hyperopt] {
            let name = Self::object_name(id, task);
            let inspect = ctx
                .guard(
                    "find-job",
                    self.client.docker().inspect_container(&name, None::<InspectContainerOptions>),
                )
                .await?;
            match inspect {
                Ok(details) => {
                    let task = details
                        .config
                        .as_ref()
                        .and_then(|c| c.labels.as_ref())
                        .and_then(|labels| labels.get(LABEL_TASK_TYPE))
                        .and_then(|v| TaskType::from_label(v))
                        .unwrap_or(task);
                    if let Some(container) = details.id {
                        return Ok(Some((container, task)));
                    }
                }
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(docker_err("find-job", e)),
            }
        }

        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{LABEL_MANAGED}=true"), format!("{LABEL_JOB_ID}={id}")],
        );
        let options = ListContainersOptions { all: true, filters, ..Default::default() };
        let found = ctx
            .guard("find-job", self.client.docker().list_containers(Some(options)))
            .await?
            .map_err(|e| docker_err("find-job", e))?;
        Ok(found.into_iter().next().and_then(|summary| {
            let task = summary
                .labels
                .as_ref()
                .and_then(|labels| labels.get(LABEL_TASK_TYPE))
                .and_then(|v| TaskType::from_label(v))?;
            Some((summary.id?, task))
        }))
    }

    async fn resolve_required(
        &self,
        ctx: &OpCtx,
        operation: &str,
        id: &WorkloadId,
    ) -> Result<(String, TaskType)> {
        self.resolve(ctx, id).await?.ok_or_else(|| {
            Error::not_found(operation, backtest_object_name(id)).with_workload(*id)
        })
    }

    /// Materialize the merged config and strategy source, start the job
    /// container. Shared by both families.
    async fn start_job(
        &self,
        ctx: &OpCtx,
        spec: &BacktestSpec,
        task: TaskType,
        cmd: Vec<String>,
    ) -> Result<SubstrateHandle> {
        let id = spec.id;
        let name = Self::object_name(&id, task);
        let config_json = serde_json::to_string_pretty(&Value::Object(spec.merged_config()))
            .map_err(|e| Error::new("start-job", ErrorKind::Serialization(e)).with_workload(id))?;

        let mut mounts = vec![
            Mount {
                target: Some(layout::data_dir()),
                source: Some(SHARED_DATA_VOLUME.to_string()),
                typ: Some(MountTypeEnum::VOLUME),
                read_only: Some(true),
                ..Default::default()
            },
        ];

        if self.client.is_remote() {
            let userdata = Self::userdata_volume(&id, task);
            let results = Self::results_volume(&id, task);
            self.helper.ensure_helper_image(ctx).await?;
            self.helper.ensure_volume(ctx, &userdata).await?;
            self.helper.ensure_volume(ctx, &results).await?;
            self.helper.write_file(ctx, &userdata, "config.json", &config_json).await?;
            self.helper
                .write_file(
                    ctx,
                    &userdata,
                    &format!("strategies/{}.py", spec.strategy),
                    &spec.strategy_code,
                )
                .await?;
            mounts.push(Mount {
                target: Some(layout::USER_DATA_DIR.to_string()),
                source: Some(userdata),
                typ: Some(MountTypeEnum::VOLUME),
                ..Default::default()
            });
            mounts.push(Mount {
                target: Some(Self::results_mount_target(task)),
                source: Some(results),
                typ: Some(MountTypeEnum::VOLUME),
                ..Default::default()
            });
        } else {
            let userdata_dir = self.client.scratch_dir(&format!("jobs/{id}/user_data"));
            let results_dir = self.results_scratch(&id);
            let write = |path: PathBuf, contents: &str| -> Result<()> {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::new("start-job", ErrorKind::Io(e)).with_workload(id))?;
                }
                std::fs::write(&path, contents)
                    .map_err(|e| Error::new("start-job", ErrorKind::Io(e)).with_workload(id))
            };
            write(userdata_dir.join("config.json"), &config_json)?;
            write(
                userdata_dir.join("strategies").join(format!("{}.py", spec.strategy)),
                &spec.strategy_code,
            )?;
            std::fs::create_dir_all(&results_dir)
                .map_err(|e| Error::new("start-job", ErrorKind::Io(e)).with_workload(id))?;
            mounts.push(Mount {
                target: Some(layout::USER_DATA_DIR.to_string()),
                source: Some(userdata_dir.to_string_lossy().into_owned()),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            });
            mounts.push(Mount {
                target: Some(Self::results_mount_target(task)),
                source: Some(results_dir.to_string_lossy().into_owned()),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            });
        }

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(cmd),
            env: Some(env),
            labels: Some(job_labels(&id, task)),
            host_config: Some(HostConfig {
                memory: spec.limits.memory_bytes,
                cpu_quota: spec.limits.cpu_quota_us(),
                cpu_period: spec.limits.cpus.map(|_| CPU_QUOTA_PERIOD_US),
                // Auto-remove stays off: the exited container anchors the
                // results volume until extraction.
                auto_remove: Some(false),
                mounts: Some(mounts),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions { name: name.clone(), platform: None };
        let created = ctx
            .guard("start-job", self.client.docker().create_container(Some(options), config))
            .await
            .and_then(|r| r.map_err(|e| docker_err("start-job", e)));
        let created = match created {
            Ok(created) => created,
            Err(e) => {
                self.remove_job_artifacts(ctx, &id, task).await;
                return Err(e.with_workload(id));
            }
        };

        let started = ctx
            .guard(
                "start-job",
                self.client.docker().start_container(&name, None::<StartContainerOptions<String>>),
            )
            .await
            .and_then(|r| r.map_err(|e| docker_err("start-job", e)));
        if let Err(e) = started {
            let remove = RemoveContainerOptions { force: true, v: true, ..Default::default() };
            if let Err(remove_err) = self.client.docker().remove_container(&name, Some(remove)).await
            {
                warn!(job = %id, error = %remove_err, "failed to unwind created job container");
            }
            self.remove_job_artifacts(ctx, &id, task).await;
            return Err(e.with_workload(id));
        }

        info!(job = %id, task = task.as_str(), container = %name, "one-shot job started");
        Ok(SubstrateHandle::new(created.id))
    }

    async fn remove_job_artifacts(&self, ctx: &OpCtx, id: &WorkloadId, task: TaskType) {
        if self.client.is_remote() {
            for volume in
                [Self::userdata_volume(id, task), Self::results_volume(id, task)]
            {
                if let Err(e) = self.helper.remove_volume(ctx, &volume).await {
                    warn!(job = %id, volume = %volume, error = %e, "failed to remove job volume");
                }
            }
        } else {
            let dir = self.client.scratch_dir(&format!("jobs/{id}"));
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(job = %id, error = %e, "failed to remove job scratch directory");
                }
            }
        }
    }

    async fn inspect(&self, ctx: &OpCtx, container: &str) -> Result<ContainerInspectResponse> {
        ctx.guard(
            "get-status",
            self.client.docker().inspect_container(container, None::<InspectContainerOptions>),
        )
        .await?
        .map_err(|e| docker_err("get-status", e))
    }

    async fn status_of(
        &self,
        ctx: &OpCtx,
        container: &str,
        id: WorkloadId,
        task: TaskType,
    ) -> Result<JobStatus> {
        let details = self.inspect(ctx, container).await?;
        let state = details.state.clone().unwrap_or_default();
        let exit_code = state.exit_code;

        let job_state = match state.status {
            Some(ContainerStateStatusEnum::RUNNING)
            | Some(ContainerStateStatusEnum::RESTARTING) => JobState::Running,
            Some(ContainerStateStatusEnum::CREATED) => JobState::Queued,
            Some(ContainerStateStatusEnum::DEAD) => JobState::Failed,
            _ => {
                if exit_code.unwrap_or(0) == 0 {
                    JobState::Completed
                } else {
                    JobState::Failed
                }
            }
        };

        let usage = if job_state == JobState::Running {
            let options = StatsOptions { stream: false, one_shot: false };
            let mut stream = self.client.docker().stats(container, Some(options));
            match ctx.guard("get-status", stream.next()).await {
                Ok(Some(Ok(stats))) => usage_from_stats(&stats),
                _ => ResourceUsage::default(),
            }
        } else {
            ResourceUsage::default()
        };

        // Epoch progress comes out of the optimizer's own log lines.
        let epochs = if task == TaskType::Hyperopt && job_state == JobState::Running {
            let options = LogOptions { tail: Some(200), ..LogOptions::capture_all() };
            match logstream::collect(&self.client, ctx, container, &options).await {
                Ok(logs) => parse_epoch_progress(&logs),
                Err(_) => None,
            }
        } else {
            None
        };

        let progress_percent = epochs.map(|e| {
            if e.total_epochs == 0 {
                0.0
            } else {
                100.0 * f64::from(e.current_epoch) / f64::from(e.total_epochs)
            }
        });

        Ok(JobStatus {
            id,
            state: job_state,
            handle: details.id.map(SubstrateHandle::new),
            usage,
            progress_percent,
            epochs,
            error: state.error.filter(|e| !e.is_empty()).or_else(|| {
                (job_state == JobState::Failed)
                    .then(|| format!("job exited with status {}", exit_code.unwrap_or(-1)))
            }),
            created_at: parse_docker_time(details.created.as_ref()),
            started_at: parse_docker_time(state.started_at.as_ref()),
            finished_at: parse_docker_time(state.finished_at.as_ref()),
        })
    }

    /// Read a file out of the job's results location, local or remote.
    async fn read_results_file(
        &self,
        ctx: &OpCtx,
        id: &WorkloadId,
        task: TaskType,
        path: &str,
    ) -> Result<Vec<u8>> {
        if self.client.is_remote() {
            self.helper.read_file(ctx, &Self::results_volume(id, task), path).await
        } else {
            std::fs::read(self.results_scratch(id).join(path))
                .map_err(|e| Error::new("get-result", ErrorKind::Io(e)).with_workload(*id))
        }
    }

    /// Extract one member from a zip archive in the results location.
    async fn read_results_zip_member(
        &self,
        ctx: &OpCtx,
        id: &WorkloadId,
        task: TaskType,
        archive: &str,
        member: &str,
    ) -> Result<Vec<u8>> {
        if self.client.is_remote() {
            return self
                .helper
                .read_file_from_zip(ctx, &Self::results_volume(id, task), archive, member)
                .await;
        }
        let path = self.results_scratch(id).join(archive);
        let file = std::fs::File::open(&path)
            .map_err(|e| Error::new("get-result", ErrorKind::Io(e)).with_workload(*id))?;
        let mut zip = zip::ZipArchive::new(file).map_err(|e| {
            Error::new("get-result", ErrorKind::Other(format!("unreadable archive: {e}")))
                .with_workload(*id)
        })?;
        let mut entry = zip.by_name(member).map_err(|e| {
            Error::new(
                "get-result",
                ErrorKind::Other(format!("archive member '{member}' missing: {e}")),
            )
            .with_workload(*id)
        })?;
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut buf)
            .map_err(|e| Error::new("get-result", ErrorKind::Io(e)).with_workload(*id))?;
        Ok(buf)
    }

    async fn terminal_status(
        &self,
        ctx: &OpCtx,
        id: &WorkloadId,
    ) -> Result<(String, TaskType, JobStatus, String)> {
        let (container, task) = self.resolve_required(ctx, "get-result", id).await?;
        let status = self.status_of(ctx, &container, *id, task).await?;
        if !status.state.is_terminal() {
            return Err(Error::validation(
                "get-result",
                format!("job is still {}; results require a terminal state", status.state),
            )
            .with_workload(*id));
        }
        let logs =
            logstream::collect(&self.client, ctx, &container, &LogOptions::capture_all()).await?;
        Ok((container, task, status, logs))
    }
}

/// Resolve the archive and member names from the pointer file's payload.
fn archive_and_member(latest: &str) -> (String, String) {
    if let Some(stem) = latest.strip_suffix(".zip") {
        (latest.to_string(), format!("{stem}.json"))
    } else {
        (format!("{latest}.zip"), format!("{latest}.json"))
    }
}

/// Parse optimizer progress out of its log tail.
fn parse_epoch_progress(logs: &str) -> Option<EpochProgress> {
    let mut progress: Option<EpochProgress> = None;
    for line in logs.lines() {
        if let Some(caps) = EPOCH_RE.captures(line) {
            let current = caps[1].parse().ok()?;
            let total = caps[2].parse().ok()?;
            let objective = OBJECTIVE_RE
                .captures(line)
                .and_then(|c| c[1].parse::<f64>().ok())
                .or(progress.and_then(|p| p.current_objective));
            progress = Some(EpochProgress {
                current_epoch: current,
                total_epochs: total,
                current_objective: objective,
            });
        }
    }
    progress
}

#[async_trait]
impl JobController for DockerJobs {
    async fn start_backtest(&self, ctx: &OpCtx, spec: &BacktestSpec) -> Result<SubstrateHandle> {
        spec.validate()?;
        self.start_job(ctx, spec, TaskType::Backtest, layout::backtesting_command(&spec.strategy))
            .await
    }

    async fn start_hyperopt(&self, ctx: &OpCtx, spec: &HyperoptSpec) -> Result<SubstrateHandle> {
        spec.validate()?;
        self.start_job(
            ctx,
            &spec.backtest,
            TaskType::Hyperopt,
            layout::hyperopt_command(spec),
        )
        .await
    }

    async fn status(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<JobStatus> {
        let (container, task) = self.resolve_required(ctx, "get-status", id).await?;
        self.status_of(ctx, &container, *id, task).await.map_err(|e| e.with_workload(*id))
    }

    async fn backtest_result(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<BacktestResult> {
        let (_, task, status, logs) = self.terminal_status(ctx, id).await?;
        let (started, finished): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
            (status.started_at, status.finished_at);

        let pointer = match self
            .read_results_file(ctx, id, task, layout::LAST_RESULT_POINTER)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(job = %id, error = %e, "result pointer unreadable");
                return Ok(BacktestResult::extraction_failed(
                    *id,
                    status.state,
                    None,
                    format!("pointer file {} unreadable: {e}", layout::LAST_RESULT_POINTER),
                    logs,
                    started,
                    finished,
                ));
            }
        };

        let latest = serde_json::from_slice::<Value>(&pointer)
            .ok()
            .and_then(|v| v.get("latest_backtest").and_then(Value::as_str).map(String::from));
        let Some(latest) = latest else {
            return Ok(BacktestResult::extraction_failed(
                *id,
                status.state,
                None,
                "pointer file does not name a latest backtest archive",
                logs,
                started,
                finished,
            ));
        };

        let (archive, member) = archive_and_member(&latest);
        let raw_bytes = match self
            .read_results_zip_member(ctx, id, task, &archive, &member)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(BacktestResult::extraction_failed(
                    *id,
                    status.state,
                    None,
                    format!("archive '{archive}' member '{member}' unreadable: {e}"),
                    logs,
                    started,
                    finished,
                ));
            }
        };

        match serde_json::from_slice::<Value>(&raw_bytes) {
            Ok(raw) => {
                Ok(BacktestResult::from_raw(*id, status.state, None, raw, logs, started, finished))
            }
            Err(e) => Ok(BacktestResult::extraction_failed(
                *id,
                status.state,
                None,
                format!("result document is not valid JSON: {e}"),
                logs,
                started,
                finished,
            )),
        }
    }

    async fn hyperopt_result(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<HyperoptResult> {
        let (_, task, status, logs) = self.terminal_status(ctx, id).await?;

        let pointer = match self
            .read_results_file(ctx, id, task, layout::LAST_RESULT_POINTER)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(HyperoptResult::extraction_failed(
                    *id,
                    status.state,
                    None,
                    format!("pointer file {} unreadable: {e}", layout::LAST_RESULT_POINTER),
                    logs,
                ));
            }
        };

        let latest = serde_json::from_slice::<Value>(&pointer)
            .ok()
            .and_then(|v| v.get("latest_hyperopt").and_then(Value::as_str).map(String::from));
        let Some(latest) = latest else {
            return Ok(HyperoptResult::extraction_failed(
                *id,
                status.state,
                None,
                "pointer file does not name a latest hyperopt output",
                logs,
            ));
        };

        let records_bytes = match self.read_results_file(ctx, id, task, &latest).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(HyperoptResult::extraction_failed(
                    *id,
                    status.state,
                    None,
                    format!("optimizer output '{latest}' unreadable: {e}"),
                    logs,
                ));
            }
        };

        let records: Vec<Value> = String::from_utf8_lossy(&records_bytes)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        if records.is_empty() {
            return Ok(HyperoptResult::extraction_failed(
                *id,
                status.state,
                None,
                format!("optimizer output '{latest}' held no epoch records"),
                logs,
            ));
        }
        Ok(HyperoptResult::from_epoch_records(
            *id,
            status.state,
            None,
            &records,
            logs,
            status.started_at,
            status.finished_at,
        ))
    }

    async fn logs(&self, ctx: &OpCtx, id: &WorkloadId, options: LogOptions) -> Result<LogStream> {
        let (container, _) = self.resolve_required(ctx, "get-logs", id).await?;
        Ok(logstream::open(&self.client, &container, &options))
    }

    async fn stop(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        let (container, _) = self.resolve_required(ctx, "stop", id).await?;
        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        ctx.guard("stop", self.client.docker().stop_container(&container, Some(options)))
            .await?
            .map_err(|e| docker_err("stop", e).with_workload(*id))
    }

    async fn delete(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        if let Some((container, task)) = self.resolve(ctx, id).await? {
            let remove = RemoveContainerOptions { force: true, v: true, ..Default::default() };
            let removed = ctx
                .guard("delete", self.client.docker().remove_container(&container, Some(remove)))
                .await?;
            match removed {
                Ok(()) => {}
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(docker_err("delete", e).with_workload(*id)),
            }
            self.remove_job_artifacts(ctx, id, task).await;
        } else {
            // No container left; clear artifacts for both possible
            // families.
            self.remove_job_artifacts(ctx, id, TaskType::Backtest).await;
            self.remove_job_artifacts(ctx, id, TaskType::Hyperopt).await;
        }
        debug!(job = %id, "job deleted");
        Ok(())
    }

    async fn list(&self, ctx: &OpCtx) -> Result<Vec<JobStatus>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{LABEL_MANAGED}=true")]);
        let options = ListContainersOptions { all: true, filters, ..Default::default() };
        let containers = ctx
            .guard("list", self.client.docker().list_containers(Some(options)))
            .await?
            .map_err(|e| docker_err("list", e))?;

        let mut statuses = Vec::new();
        for summary in containers {
            let labels = summary.labels.unwrap_or_default();
            let Some(id) = labels.get(LABEL_JOB_ID).and_then(|raw| raw.parse::<WorkloadId>().ok())
            else {
                continue;
            };
            let Some(task) = labels.get(LABEL_TASK_TYPE).and_then(|v| TaskType::from_label(v))
            else {
                continue;
            };
            if task == TaskType::DataDownload {
                continue;
            }
            let Some(container) = summary.id else { continue };
            match self.status_of(ctx, &container, id, task).await {
                Ok(status) => statuses.push(status),
                Err(e) if matches!(e.kind(), ErrorKind::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
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
        SubstrateKind::Docker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_member_shares_the_base_name() {
        assert_eq!(
            archive_and_member("results-20240301.zip"),
            ("results-20240301.zip".to_string(), "results-20240301.json".to_string())
        );
        assert_eq!(
            archive_and_member("backtest-result-2024-03-01_10-00-00"),
            (
                "backtest-result-2024-03-01_10-00-00.zip".to_string(),
                "backtest-result-2024-03-01_10-00-00.json".to_string()
            )
        );
    }

    #[test]
    fn epoch_progress_parses_optimizer_lines() {
        let logs = "\
 42/500:     38 trades. Avg profit 0.52%. Objective: -1.83244
 43/500:     41 trades. Avg profit 0.48%. Objective: -1.79011
";
        let progress = parse_epoch_progress(logs).unwrap();
        assert_eq!(progress.current_epoch, 43);
        assert_eq!(progress.total_epochs, 500);
        assert_eq!(progress.current_objective, Some(-1.79011));
    }

    #[test]
    fn epoch_progress_absent_from_unrelated_logs() {
        assert!(parse_epoch_progress("loading data\nno epochs here\n").is_none());
    }

    #[test]
    fn job_volume_names_derive_from_object_names() {
        let id: WorkloadId = "6e0fb9a2-44f5-4b5a-9c6e-0a4f6f8f2b11".parse().unwrap();
        assert_eq!(
            DockerJobs::results_volume(&id, TaskType::Backtest),
            format!("quantflow-backtest-{id}-results")
        );
        assert_eq!(
            DockerJobs::userdata_volume(&id, TaskType::Hyperopt),
            format!("quantflow-hyperopt-{id}-userdata")
        );
    }
}
