// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! In-memory mock substrate
//!
//! Implements all three capability interfaces against a shared in-memory
//! state table. Tests drive the substrate side explicitly — observe a
//! healthy bot, let a backtest finish with a given raw result, fail the
//! next operation — and assert on what the orchestrator-facing interfaces
//! return.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use quantflow::error::{Error, ErrorKind, Result};
use quantflow::jobs::{BacktestSpec, DataDownloadSpec, HyperoptSpec};
use quantflow::layout;
use quantflow::logs::{LogOptions, LogStream};
use quantflow::naming::{bot_object_name, TaskType};
use quantflow::results::{BacktestResult, HyperoptResult};
use quantflow::status::{JobState, JobStatus, ResourceUsage, WorkloadState, WorkloadStatus};
use quantflow::workload::{BotSpec, SubstrateHandle, WorkloadId, WorkloadUpdate};
use quantflow::{
    DataDownloadController, DownloadStatus, DownloadTaskId, JobController, OpCtx, SubstrateKind,
    WorkloadController,
};
use quantflow::runner::DownloadState;

#[derive(Debug, Clone)]
struct MockBot {
    spec: BotSpec,
    state: WorkloadState,
    healthy: bool,
    command: Vec<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct MockJob {
    task: TaskType,
    state: JobState,
    exit_code: Option<i64>,
    logs: String,
    raw_result: Option<Value>,
    epoch_records: Vec<Value>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct MockDownload {
    state: DownloadState,
    logs: String,
    exchange_total: u32,
}

#[derive(Default)]
struct State {
    bots: HashMap<WorkloadId, MockBot>,
    jobs: HashMap<WorkloadId, MockJob>,
    downloads: HashMap<WorkloadId, MockDownload>,
    fail_next: Option<ErrorKind>,
}

/// Shared in-memory substrate; clone handles freely across controllers.
#[derive(Clone, Default)]
pub struct MockSubstrate {
    state: Arc<Mutex<State>>,
}

impl MockSubstrate {
    /// Fresh, empty substrate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next operation fail with `kind`. One-shot.
    pub fn fail_next(&self, kind: ErrorKind) {
        self.state.lock().fail_next = Some(kind);
    }

    fn take_failure(&self, operation: &str) -> Result<()> {
        if let Some(kind) = self.state.lock().fail_next.take() {
            return Err(Error::new(operation, kind));
        }
        Ok(())
    }

    /// Substrate-side observation: the bot's health probe reports
    /// `healthy`.
    pub fn observe_health(&self, id: &WorkloadId, healthy: bool) {
        if let Some(bot) = self.state.lock().bots.get_mut(id) {
            bot.healthy = healthy;
            bot.state = if healthy { WorkloadState::Running } else { WorkloadState::Unhealthy };
        }
    }

    /// Substrate-side observation: the bot crashed unrecoverably.
    pub fn observe_fault(&self, id: &WorkloadId) {
        if let Some(bot) = self.state.lock().bots.get_mut(id) {
            bot.healthy = false;
            bot.state = WorkloadState::Error;
        }
    }

    /// The command line the substrate received for a bot.
    #[must_use]
    pub fn command_of(&self, id: &WorkloadId) -> Option<Vec<String>> {
        self.state.lock().bots.get(id).map(|bot| bot.command.clone())
    }

    /// Whether any object exists for the workload.
    #[must_use]
    pub fn has_object(&self, id: &WorkloadId) -> bool {
        let state = self.state.lock();
        state.bots.contains_key(id) || state.jobs.contains_key(id)
    }

    /// Let a job finish with the given exit code, logs and raw result
    /// document.
    pub fn finish_job(
        &self,
        id: &WorkloadId,
        exit_code: i64,
        logs: impl Into<String>,
        raw_result: Option<Value>,
    ) {
        if let Some(job) = self.state.lock().jobs.get_mut(id) {
            job.state = if exit_code == 0 { JobState::Completed } else { JobState::Failed };
            job.exit_code = Some(exit_code);
            job.logs = logs.into();
            job.raw_result = raw_result;
            job.finished_at = Some(Utc::now());
        }
    }

    /// Provide optimizer epoch records for a finished hyperopt.
    pub fn set_epoch_records(&self, id: &WorkloadId, records: Vec<Value>) {
        if let Some(job) = self.state.lock().jobs.get_mut(id) {
            job.epoch_records = records;
        }
    }

    /// Append to a download task's log, optionally completing it.
    pub fn advance_download(&self, id: &WorkloadId, logs: impl Into<String>, state: DownloadState) {
        if let Some(download) = self.state.lock().downloads.get_mut(id) {
            download.logs.push_str(&logs.into());
            download.state = state;
        }
    }

    fn snapshot_stream(content: String) -> LogStream {
        let bytes: Result<bytes::Bytes> = Ok(bytes::Bytes::from(content.into_bytes()));
        LogStream::new(
            Box::pin(futures::stream::iter(vec![bytes])),
            CancellationToken::new(),
        )
    }
}

#[async_trait]
impl WorkloadController for MockSubstrate {
    async fn create(&self, _ctx: &OpCtx, spec: &BotSpec) -> Result<SubstrateHandle> {
        spec.validate()?;
        self.take_failure("create")?;
        let mut state = self.state.lock();
        if state.bots.contains_key(&spec.id) {
            return Err(Error::new(
                "create",
                ErrorKind::AlreadyExists(bot_object_name(&spec.id)),
            )
            .with_workload(spec.id));
        }
        state.bots.insert(
            spec.id,
            MockBot {
                spec: spec.clone(),
                state: WorkloadState::Creating,
                healthy: false,
                command: layout::trade_command(spec),
                created_at: Utc::now(),
            },
        );
        Ok(SubstrateHandle::new(format!("mock-{}", spec.id)))
    }

    async fn delete(&self, _ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        self.take_failure("delete")?;
        self.state.lock().bots.remove(id);
        Ok(())
    }

    async fn start(&self, _ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        self.take_failure("start")?;
        let mut state = self.state.lock();
        let bot = state.bots.get_mut(id).ok_or_else(|| {
            Error::not_found("start", bot_object_name(id)).with_workload(*id)
        })?;
        bot.state = WorkloadState::Creating;
        Ok(())
    }

    async fn stop(&self, _ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        self.take_failure("stop")?;
        let mut state = self.state.lock();
        let bot = state.bots.get_mut(id).ok_or_else(|| {
            Error::not_found("stop", bot_object_name(id)).with_workload(*id)
        })?;
        bot.state = WorkloadState::Stopped;
        bot.healthy = false;
        Ok(())
    }

    async fn restart(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        WorkloadController::stop(self, ctx, id).await?;
        self.start(ctx, id).await
    }

    async fn status(&self, _ctx: &OpCtx, id: &WorkloadId) -> Result<WorkloadStatus> {
        self.take_failure("get-status")?;
        let state = self.state.lock();
        let bot = state.bots.get(id).ok_or_else(|| {
            Error::not_found("get-status", bot_object_name(id)).with_workload(*id)
        })?;
        Ok(WorkloadStatus {
            id: *id,
            state: bot.state,
            handle: Some(SubstrateHandle::new(format!("mock-{id}"))),
            healthy: bot.healthy,
            last_seen: Utc::now(),
            usage: ResourceUsage::default(),
            ip_address: Some("172.28.0.2".to_string()),
            host_port: Some(32801),
            error: None,
            created_at: Some(bot.created_at),
            started_at: None,
            stopped_at: None,
        })
    }

    async fn workload_ip(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<Option<String>> {
        Ok(WorkloadController::status(self, ctx, id).await?.ip_address)
    }

    async fn logs(&self, _ctx: &OpCtx, id: &WorkloadId, _options: LogOptions) -> Result<LogStream> {
        let state = self.state.lock();
        state.bots.get(id).ok_or_else(|| {
            Error::not_found("get-logs", bot_object_name(id)).with_workload(*id)
        })?;
        Ok(Self::snapshot_stream(format!("mock logs for {id}\n")))
    }

    async fn update(&self, _ctx: &OpCtx, id: &WorkloadId, update: &WorkloadUpdate) -> Result<()> {
        if update.image.is_some() {
            return Err(Error::new(
                "update",
                ErrorKind::Validation("image changes require recreating the workload".into()),
            )
            .with_workload(*id));
        }
        let mut state = self.state.lock();
        let bot = state.bots.get_mut(id).ok_or_else(|| {
            Error::not_found("update", bot_object_name(id)).with_workload(*id)
        })?;
        if let Some(limits) = update.limits {
            bot.spec.limits = limits;
        }
        Ok(())
    }

    async fn list(&self, ctx: &OpCtx) -> Result<Vec<WorkloadStatus>> {
        let ids: Vec<WorkloadId> = self.state.lock().bots.keys().copied().collect();
        let mut statuses = Vec::new();
        for id in ids {
            statuses.push(WorkloadController::status(self, ctx, &id).await?);
        }
        Ok(statuses)
    }

    async fn health_check(&self, _ctx: &OpCtx) -> Result<()> {
        self.take_failure("health-check")
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Local
    }
}

#[async_trait]
impl JobController for MockSubstrate {
    async fn start_backtest(&self, _ctx: &OpCtx, spec: &BacktestSpec) -> Result<SubstrateHandle> {
        spec.validate()?;
        self.take_failure("start-backtest")?;
        self.state.lock().jobs.insert(
            spec.id,
            MockJob {
                task: TaskType::Backtest,
                state: JobState::Running,
                exit_code: None,
                logs: String::new(),
                raw_result: None,
                epoch_records: Vec::new(),
                started_at: Some(Utc::now()),
                finished_at: None,
            },
        );
        Ok(SubstrateHandle::new(format!("mock-{}", spec.id)))
    }

    async fn start_hyperopt(&self, _ctx: &OpCtx, spec: &HyperoptSpec) -> Result<SubstrateHandle> {
        spec.validate()?;
        self.take_failure("start-hyperopt")?;
        self.state.lock().jobs.insert(
            spec.backtest.id,
            MockJob {
                task: TaskType::Hyperopt,
                state: JobState::Running,
                exit_code: None,
                logs: String::new(),
                raw_result: None,
                epoch_records: Vec::new(),
                started_at: Some(Utc::now()),
                finished_at: None,
            },
        );
        Ok(SubstrateHandle::new(format!("mock-{}", spec.backtest.id)))
    }

    async fn status(&self, _ctx: &OpCtx, id: &WorkloadId) -> Result<JobStatus> {
        self.take_failure("get-status")?;
        let state = self.state.lock();
        let job = state
            .jobs
            .get(id)
            .ok_or_else(|| Error::not_found("get-status", id.to_string()).with_workload(*id))?;
        Ok(JobStatus {
            id: *id,
            state: job.state,
            handle: Some(SubstrateHandle::new(format!("mock-{id}"))),
            usage: ResourceUsage::default(),
            progress_percent: None,
            epochs: None,
            error: None,
            created_at: job.started_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        })
    }

    async fn backtest_result(&self, _ctx: &OpCtx, id: &WorkloadId) -> Result<BacktestResult> {
        self.take_failure("get-result")?;
        let state = self.state.lock();
        let job = state
            .jobs
            .get(id)
            .ok_or_else(|| Error::not_found("get-result", id.to_string()).with_workload(*id))?;
        if !job.state.is_terminal() {
            return Err(Error::validation(
                "get-result",
                format!("job is still {}; results require a terminal state", job.state),
            )
            .with_workload(*id));
        }
        match &job.raw_result {
            Some(raw) => Ok(BacktestResult::from_raw(
                *id,
                job.state,
                job.exit_code,
                raw.clone(),
                job.logs.clone(),
                job.started_at,
                job.finished_at,
            )),
            None => Ok(BacktestResult::extraction_failed(
                *id,
                job.state,
                job.exit_code,
                "pointer file .last_result.json missing",
                job.logs.clone(),
                job.started_at,
                job.finished_at,
            )),
        }
    }

    async fn hyperopt_result(&self, _ctx: &OpCtx, id: &WorkloadId) -> Result<HyperoptResult> {
        self.take_failure("get-result")?;
        let state = self.state.lock();
        let job = state
            .jobs
            .get(id)
            .filter(|job| job.task == TaskType::Hyperopt)
            .ok_or_else(|| Error::not_found("get-result", id.to_string()).with_workload(*id))?;
        if !job.state.is_terminal() {
            return Err(Error::validation(
                "get-result",
                format!("job is still {}; results require a terminal state", job.state),
            )
            .with_workload(*id));
        }
        if job.epoch_records.is_empty() {
            return Ok(HyperoptResult::extraction_failed(
                *id,
                job.state,
                job.exit_code,
                "optimizer output held no epoch records",
                job.logs.clone(),
            ));
        }
        Ok(HyperoptResult::from_epoch_records(
            *id,
            job.state,
            job.exit_code,
            &job.epoch_records,
            job.logs.clone(),
            job.started_at,
            job.finished_at,
        ))
    }

    async fn logs(&self, _ctx: &OpCtx, id: &WorkloadId, _options: LogOptions) -> Result<LogStream> {
        let state = self.state.lock();
        let job = state
            .jobs
            .get(id)
            .ok_or_else(|| Error::not_found("get-logs", id.to_string()).with_workload(*id))?;
        Ok(Self::snapshot_stream(job.logs.clone()))
    }

    async fn stop(&self, _ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found("stop", id.to_string()).with_workload(*id))?;
        if !job.state.is_terminal() {
            job.state = JobState::Failed;
            job.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn delete(&self, _ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        self.take_failure("delete")?;
        self.state.lock().jobs.remove(id);
        Ok(())
    }

    async fn list(&self, ctx: &OpCtx) -> Result<Vec<JobStatus>> {
        let ids: Vec<WorkloadId> = self.state.lock().jobs.keys().copied().collect();
        let mut statuses = Vec::new();
        for id in ids {
            statuses.push(JobController::status(self, ctx, &id).await?);
        }
        Ok(statuses)
    }

    async fn health_check(&self, _ctx: &OpCtx) -> Result<()> {
        self.take_failure("health-check")
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Local
    }
}

#[async_trait]
impl DataDownloadController for MockSubstrate {
    async fn start_download(&self, _ctx: &OpCtx, spec: &DataDownloadSpec) -> Result<DownloadTaskId> {
        spec.validate()?;
        self.take_failure("start-download")?;
        self.state.lock().downloads.insert(
            spec.id,
            MockDownload {
                state: DownloadState::Downloading,
                logs: String::new(),
                exchange_total: spec.exchanges.len() as u32,
            },
        );
        Ok(DownloadTaskId::new(spec.id.to_string()))
    }

    async fn status(&self, _ctx: &OpCtx, task: &DownloadTaskId) -> Result<DownloadStatus> {
        self.take_failure("get-status")?;
        let id: WorkloadId = task
            .as_str()
            .parse()
            .map_err(|_| Error::validation("get-status", "malformed task id"))?;
        let state = self.state.lock();
        let Some(download) = state.downloads.get(&id) else {
            return Ok(DownloadStatus { state: DownloadState::Idle, ..Default::default() });
        };
        let available = if download.state == DownloadState::Completed {
            quantflow::download::parse_available_data(&download.logs)?
        } else {
            None
        };
        Ok(DownloadStatus {
            state: download.state,
            progress: quantflow::download::parse_progress(&download.logs, download.exchange_total),
            error: None,
            available,
        })
    }

    async fn logs(
        &self,
        _ctx: &OpCtx,
        task: &DownloadTaskId,
        _options: LogOptions,
    ) -> Result<LogStream> {
        let id: WorkloadId = task
            .as_str()
            .parse()
            .map_err(|_| Error::validation("get-logs", "malformed task id"))?;
        let state = self.state.lock();
        let logs = state.downloads.get(&id).map(|d| d.logs.clone()).unwrap_or_default();
        Ok(Self::snapshot_stream(logs))
    }

    async fn cancel(&self, _ctx: &OpCtx, task: &DownloadTaskId) -> Result<()> {
        let id: WorkloadId = task
            .as_str()
            .parse()
            .map_err(|_| Error::validation("cancel", "malformed task id"))?;
        if let Some(download) = self.state.lock().downloads.get_mut(&id) {
            download.state = DownloadState::Failed;
        }
        Ok(())
    }

    async fn cleanup(&self, _ctx: &OpCtx, task: &DownloadTaskId) -> Result<()> {
        let id: WorkloadId = task
            .as_str()
            .parse()
            .map_err(|_| Error::validation("cleanup", "malformed task id"))?;
        self.state.lock().downloads.remove(&id);
        Ok(())
    }

    async fn health_check(&self, _ctx: &OpCtx) -> Result<()> {
        self.take_failure("health-check")
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Local
    }
}
