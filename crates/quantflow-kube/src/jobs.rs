// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! One-shot job control on a cluster
//!
//! Backtests and hyperopts run as batch jobs with `backoffLimit: 0` and no
//! TTL — the job object and its results claim persist after exit so
//! results can be extracted. Extraction reads the claim through helper
//! pods (the orchestrator has no filesystem access to cluster volumes).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::AsyncBufReadExt;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use quantflow::error::{Error, ErrorKind, Result};
use quantflow::jobs::{BacktestSpec, HyperoptSpec};
use quantflow::layout;
use quantflow::logs::{LogEntry, LogOptions, LogSource, LogStream};
use quantflow::naming::{
    backtest_object_name, hyperopt_object_name, job_labels, TaskType, LABEL_JOB_ID, LABEL_MANAGED,
    LABEL_TASK_TYPE,
};
use quantflow::results::{BacktestResult, HyperoptResult};
use quantflow::status::{JobState, JobStatus, ResourceUsage};
use quantflow::workload::{SubstrateHandle, WorkloadId};
use quantflow::{JobController, OpCtx, SubstrateKind};

use crate::client::{is_not_found, kube_err, KubeClient};
use crate::objects::{
    build_job, build_job_config_map, build_strategy_chunks, chunk_strategy_source,
    config_object_name, sanitized_labels, strategy_chunk_name, JobClaims,
};
use crate::volumes::KubeVolumeHelper;

/// Shared historical-data claim, populated by download tasks.
pub const SHARED_DATA_CLAIM: &str = "quantflow-data";

/// Cluster implementation of [`JobController`].
pub struct KubeJobs {
    client: KubeClient,
    helper: KubeVolumeHelper,
}

impl KubeJobs {
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

    fn config_maps(&self) -> Api<k8s_openapi::api::core::v1::ConfigMap> {
        Api::namespaced(self.client.client(), self.client.namespace())
    }

    fn object_name(id: &WorkloadId, task: TaskType) -> String {
        match task {
            TaskType::Hyperopt => hyperopt_object_name(id),
            _ => backtest_object_name(id),
        }
    }

    fn results_claim(id: &WorkloadId, task: TaskType) -> String {
        format!("{}-results", Self::object_name(id, task))
    }

    fn results_target(task: TaskType) -> String {
        match task {
            TaskType::Hyperopt => layout::hyperopt_results_dir(),
            _ => layout::backtest_results_dir(),
        }
    }

    async fn resolve(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<Option<(Job, TaskType)>> {
        for task in [TaskType::Backtest, TaskType::Hyperopt] {
            let name = Self::object_name(id, task);
            let found = ctx
                .guard("find-job", self.jobs().get_opt(&name))
                .await?
                .map_err(|e| kube_err("find-job", e))?;
            if let Some(job) = found {
                let task = job
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(LABEL_TASK_TYPE))
                    .and_then(|v| TaskType::from_label(v))
                    .unwrap_or(task);
                return Ok(Some((job, task)));
            }
        }
        Ok(None)
    }

    async fn resolve_required(
        &self,
        ctx: &OpCtx,
        operation: &str,
        id: &WorkloadId,
    ) -> Result<(Job, TaskType)> {
        self.resolve(ctx, id).await?.ok_or_else(|| {
            Error::not_found(operation, backtest_object_name(id)).with_workload(*id)
        })
    }

    async fn start_job(
        &self,
        ctx: &OpCtx,
        spec: &BacktestSpec,
        task: TaskType,
        command: Vec<String>,
    ) -> Result<SubstrateHandle> {
        let id = spec.id;
        let object = Self::object_name(&id, task);
        let namespace = self.client.namespace();
        let labels: BTreeMap<String, String> =
            sanitized_labels(job_labels(&id, task).into_iter().collect());

        let config_json = serde_json::to_string_pretty(&Value::Object(spec.merged_config()))
            .map_err(|e| Error::new("start-job", ErrorKind::Serialization(e)).with_workload(id))?;

        let results_claim = Self::results_claim(&id, task);
        self.helper.ensure_claim(ctx, SHARED_DATA_CLAIM).await?;
        self.helper.ensure_claim(ctx, &results_claim).await?;

        let config_map = build_job_config_map(&object, namespace, &labels, &config_json);
        let chunks = build_strategy_chunks(&object, namespace, &labels, &spec.strategy_code);
        let chunk_count = chunk_strategy_source(&spec.strategy_code).len();
        let claims = JobClaims {
            results: (results_claim.as_str(), Self::results_target(task)),
            data: SHARED_DATA_CLAIM,
        };
        let pod_spec = crate::objects::build_job_pod_spec(
            &object,
            &spec.image,
            command,
            &spec.env,
            &spec.limits,
            &format!("{}.py", spec.strategy),
            chunk_count,
            &claims,
        );
        let job = build_job(&object, namespace, &labels, pod_spec);

        let unwind = |e: Error| async {
            self.remove_artifacts(ctx, &id, task).await;
            e.with_workload(id)
        };

        let created = ctx
            .guard("start-job", self.config_maps().create(&PostParams::default(), &config_map))
            .await?;
        if let Err(e) = created {
            return Err(unwind(kube_err("start-job", e)).await);
        }
        for chunk in &chunks {
            let created = ctx
                .guard("start-job", self.config_maps().create(&PostParams::default(), chunk))
                .await?;
            if let Err(e) = created {
                return Err(unwind(kube_err("start-job", e)).await);
            }
        }
        let created =
            ctx.guard("start-job", self.jobs().create(&PostParams::default(), &job)).await?;
        match created {
            Ok(created) => {
                info!(job = %id, task = task.as_str(), object = %object, "one-shot job submitted");
                Ok(SubstrateHandle::new(created.metadata.uid.unwrap_or(object)))
            }
            Err(e) => Err(unwind(kube_err("start-job", e)).await),
        }
    }

    async fn remove_artifacts(&self, ctx: &OpCtx, id: &WorkloadId, task: TaskType) {
        let object = Self::object_name(id, task);
        for name in [config_object_name(&object)]
            .into_iter()
            .chain((0..64).map(|i| strategy_chunk_name(&object, i)))
        {
            match self.config_maps().delete(&name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(e) if is_not_found(&e) => {
                    // Chunk names are probed in order; the first missing
                    // one ends the chunk range.
                    if name.contains("-strategy-") {
                        break;
                    }
                }
                Err(e) => warn!(job = %id, object = %name, error = %e, "failed to delete config object"),
            }
        }
        if let Err(e) = self.helper.remove_claim(ctx, &Self::results_claim(id, task)).await {
            warn!(job = %id, error = %e, "failed to remove results claim");
        }
    }

    async fn find_pod(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<Option<Pod>> {
        let params = ListParams::default().labels(&format!("{LABEL_JOB_ID}={id}"));
        let pods = ctx
            .guard("find-pod", self.pods().list(&params))
            .await?
            .map_err(|e| kube_err("find-pod", e))?;
        Ok(pods.items.into_iter().next())
    }

    fn status_from_job(job: &Job, id: WorkloadId) -> JobStatus {
        let status = job.status.as_ref();
        let active = status.and_then(|s| s.active).unwrap_or(0);
        let succeeded = status.and_then(|s| s.succeeded).unwrap_or(0);
        let failed = status.and_then(|s| s.failed).unwrap_or(0);

        let state = if succeeded > 0 {
            JobState::Completed
        } else if failed > 0 {
            JobState::Failed
        } else if active > 0 {
            JobState::Running
        } else {
            JobState::Queued
        };

        let started_at: Option<DateTime<Utc>> =
            status.and_then(|s| s.start_time.as_ref()).map(|t| t.0);
        let finished_at: Option<DateTime<Utc>> =
            status.and_then(|s| s.completion_time.as_ref()).map(|t| t.0);

        JobStatus {
            id,
            state,
            handle: job.metadata.uid.clone().map(SubstrateHandle::new),
            usage: ResourceUsage::default(),
            progress_percent: None,
            epochs: None,
            error: (state == JobState::Failed).then(|| {
                status
                    .and_then(|s| s.conditions.as_ref())
                    .and_then(|conditions| {
                        conditions.iter().find_map(|c| c.message.clone())
                    })
                    .unwrap_or_else(|| "job failed".to_string())
            }),
            created_at: job.metadata.creation_timestamp.as_ref().map(|t| t.0),
            started_at,
            finished_at,
        }
    }

    async fn collect_pod_logs(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<String> {
        let Some(pod) = self.find_pod(ctx, id).await?.and_then(|p| p.metadata.name) else {
            return Ok(String::new());
        };
        let params = LogParams { container: Some("workload".to_string()), ..Default::default() };
        ctx.guard("get-logs", self.pods().logs(&pod, &params))
            .await?
            .map_err(|e| kube_err("get-logs", e))
    }

    async fn terminal_status(
        &self,
        ctx: &OpCtx,
        id: &WorkloadId,
    ) -> Result<(TaskType, JobStatus, String)> {
        let (job, task) = self.resolve_required(ctx, "get-result", id).await?;
        let status = Self::status_from_job(&job, *id);
        if !status.state.is_terminal() {
            return Err(Error::validation(
                "get-result",
                format!("job is still {}; results require a terminal state", status.state),
            )
            .with_workload(*id));
        }
        let logs = self.collect_pod_logs(ctx, id).await?;
        Ok((task, status, logs))
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

#[async_trait]
impl JobController for KubeJobs {
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
        let (job, _) = self.resolve_required(ctx, "get-status", id).await?;
        Ok(Self::status_from_job(&job, *id))
    }

    async fn backtest_result(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<BacktestResult> {
        let (task, status, logs) = self.terminal_status(ctx, id).await?;
        let claim = Self::results_claim(id, task);

        let pointer = match self.helper.read_file(ctx, &claim, layout::LAST_RESULT_POINTER).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(job = %id, error = %e, "result pointer unreadable");
                return Ok(BacktestResult::extraction_failed(
                    *id,
                    status.state,
                    None,
                    format!("pointer file {} unreadable: {e}", layout::LAST_RESULT_POINTER),
                    logs,
                    status.started_at,
                    status.finished_at,
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
                status.started_at,
                status.finished_at,
            ));
        };

        let (archive, member) = archive_and_member(&latest);
        match self.helper.read_file_from_zip(ctx, &claim, &archive, &member).await {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(raw) => Ok(BacktestResult::from_raw(
                    *id,
                    status.state,
                    None,
                    raw,
                    logs,
                    status.started_at,
                    status.finished_at,
                )),
                Err(e) => Ok(BacktestResult::extraction_failed(
                    *id,
                    status.state,
                    None,
                    format!("result document is not valid JSON: {e}"),
                    logs,
                    status.started_at,
                    status.finished_at,
                )),
            },
            Err(e) => Ok(BacktestResult::extraction_failed(
                *id,
                status.state,
                None,
                format!("archive '{archive}' member '{member}' unreadable: {e}"),
                logs,
                status.started_at,
                status.finished_at,
            )),
        }
    }

    async fn hyperopt_result(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<HyperoptResult> {
        let (task, status, logs) = self.terminal_status(ctx, id).await?;
        let claim = Self::results_claim(id, task);

        let pointer = match self.helper.read_file(ctx, &claim, layout::LAST_RESULT_POINTER).await {
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

        let records_bytes = match self.helper.read_file(ctx, &claim, &latest).await {
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
        let pod = self
            .find_pod(ctx, id)
            .await?
            .and_then(|p| p.metadata.name)
            .ok_or_else(|| Error::not_found("get-logs", backtest_object_name(id)).with_workload(*id))?;

        let params = LogParams {
            follow: options.follow,
            tail_lines: options.tail.map(|n| n as i64),
            timestamps: options.timestamps,
            container: Some("workload".to_string()),
            ..Default::default()
        };
        let stream = ctx
            .guard("get-logs", self.pods().log_stream(&pod, &params))
            .await?
            .map_err(|e| kube_err("get-logs", e).with_workload(*id))?;

        let cancel = CancellationToken::new();
        let (byte_tx, byte_rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes>>(64);
        let (entry_tx, entry_rx) = tokio::sync::mpsc::channel::<LogEntry>(256);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = stream.lines();
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    line = lines.next() => match line {
                        Some(Ok(line)) => {
                            let _ = entry_tx
                                .send(LogEntry {
                                    source: LogSource::Stdout,
                                    message: line.clone(),
                                    timestamp: None,
                                })
                                .await;
                            let mut bytes = line.into_bytes();
                            bytes.push(b'\n');
                            if byte_tx.send(Ok(bytes.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let _ =
                                byte_tx.send(Err(Error::new("get-logs", ErrorKind::Io(e)))).await;
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(LogStream::new(Box::pin(ReceiverStream::new(byte_rx)), cancel).with_entries(entry_rx))
    }

    async fn stop(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        let (job, _) = self.resolve_required(ctx, "stop", id).await?;
        let Some(name) = job.metadata.name else {
            return Err(Error::not_found("stop", backtest_object_name(id)).with_workload(*id));
        };
        // Suspend the job and remove its pod; the object and results
        // claim stay for extraction or cleanup.
        let patch = json!({"spec": {"suspend": true}});
        ctx.guard("stop", self.jobs().patch(&name, &PatchParams::default(), &Patch::Merge(&patch)))
            .await?
            .map_err(|e| kube_err("stop", e).with_workload(*id))?;
        if let Some(pod) = self.find_pod(ctx, id).await?.and_then(|p| p.metadata.name) {
            let deleted = ctx
                .guard("stop", self.pods().delete(&pod, &DeleteParams::default()))
                .await?;
            match deleted {
                Ok(_) => {}
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(kube_err("stop", e).with_workload(*id)),
            }
        }
        Ok(())
    }

    async fn delete(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        if let Some((job, task)) = self.resolve(ctx, id).await? {
            if let Some(name) = job.metadata.name {
                let params = DeleteParams::background();
                let deleted = ctx.guard("delete", self.jobs().delete(&name, &params)).await?;
                match deleted {
                    Ok(_) => {}
                    Err(e) if is_not_found(&e) => {}
                    Err(e) => return Err(kube_err("delete", e).with_workload(*id)),
                }
            }
            self.remove_artifacts(ctx, id, task).await;
        } else {
            self.remove_artifacts(ctx, id, TaskType::Backtest).await;
            self.remove_artifacts(ctx, id, TaskType::Hyperopt).await;
        }
        debug!(job = %id, "job deleted");
        Ok(())
    }

    async fn list(&self, ctx: &OpCtx) -> Result<Vec<JobStatus>> {
        let params = ListParams::default().labels(&format!("{LABEL_MANAGED}=true"));
        let jobs = ctx
            .guard("list", self.jobs().list(&params))
            .await?
            .map_err(|e| kube_err("list", e))?;

        Ok(jobs
            .items
            .into_iter()
            .filter_map(|job| {
                let labels = job.metadata.labels.clone()?;
                let id = labels.get(LABEL_JOB_ID)?.parse::<WorkloadId>().ok()?;
                let task = TaskType::from_label(labels.get(LABEL_TASK_TYPE)?)?;
                if task == TaskType::DataDownload {
                    return None;
                }
                Some(Self::status_from_job(&job, id))
            })
            .collect())
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
    use k8s_openapi::api::batch::v1::JobStatus as KubeJobStatus;

    fn job_with(active: i32, succeeded: i32, failed: i32) -> Job {
        Job {
            status: Some(KubeJobStatus {
                active: Some(active),
                succeeded: Some(succeeded),
                failed: Some(failed),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn job_counters_map_onto_job_states() {
        let id = WorkloadId::random();
        assert_eq!(KubeJobs::status_from_job(&job_with(1, 0, 0), id).state, JobState::Running);
        assert_eq!(KubeJobs::status_from_job(&job_with(0, 1, 0), id).state, JobState::Completed);
        assert_eq!(KubeJobs::status_from_job(&job_with(0, 0, 1), id).state, JobState::Failed);
        assert_eq!(KubeJobs::status_from_job(&job_with(0, 0, 0), id).state, JobState::Queued);
    }

    #[test]
    fn failed_jobs_carry_an_error_message() {
        let id = WorkloadId::random();
        let status = KubeJobs::status_from_job(&job_with(0, 0, 1), id);
        assert!(status.error.is_some());
    }

    #[test]
    fn claims_derive_from_object_names() {
        let id: WorkloadId = "6e0fb9a2-44f5-4b5a-9c6e-0a4f6f8f2b11".parse().unwrap();
        assert_eq!(
            KubeJobs::results_claim(&id, TaskType::Backtest),
            format!("quantflow-backtest-{id}-results")
        );
    }
}
