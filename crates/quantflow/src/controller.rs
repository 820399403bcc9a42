// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Capability interfaces implemented by substrate drivers
//!
//! Three narrow traits instead of one god-interface: long-running workload
//! control, one-shot job control, and data-download control. Drivers may
//! implement a subset; the registry hands out whichever capability the
//! caller asked for.
//!
//! Drivers hold no per-workload mutable state — all state lives on the
//! substrate — so every trait object is `Send + Sync` and shared freely
//! across request-scoped tasks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::SubstrateKind;
use crate::error::{Error, Result};
use crate::jobs::{BacktestSpec, DataDownloadSpec, HyperoptSpec};
use crate::logs::{LogOptions, LogStream};
use crate::results::{BacktestResult, HyperoptResult};
use crate::runner::{AvailableData, DownloadProgress, DownloadState};
use crate::status::{JobStatus, WorkloadStatus};
use crate::workload::{BotSpec, SubstrateHandle, WorkloadId, WorkloadUpdate};

/// Per-operation context.
///
/// Carries the caller's cancellation token. Cancellation propagates to
/// in-flight substrate RPCs and helper-object waits; a cancelled create
/// cleans up whatever artifacts it already materialized before returning.
#[derive(Debug, Clone, Default)]
pub struct OpCtx {
    cancel: CancellationToken,
}

impl OpCtx {
    /// A context that is never cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A context driven by the caller's token.
    #[must_use]
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// The underlying token, for spawning linked child work.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the caller has already given up.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Race `fut` against cancellation.
    ///
    /// Returns [`crate::error::ErrorKind::Cancelled`] wrapped under
    /// `operation` when the token fires first; the in-flight substrate RPC
    /// is dropped at that point.
    pub async fn guard<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = T>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::cancelled(operation)),
            out = fut => Ok(out),
        }
    }
}

/// Control surface for long-running bot workloads.
#[async_trait]
pub trait WorkloadController: Send + Sync {
    /// Materialize artifacts, create and start the workload.
    ///
    /// On create failure any materialized artifacts are removed; on start
    /// failure the created substrate object is removed too. Returns the
    /// substrate handle.
    async fn create(&self, ctx: &OpCtx, spec: &BotSpec) -> Result<SubstrateHandle>;

    /// Force-remove the workload object, its volumes and artifacts.
    /// Missing objects are not an error.
    async fn delete(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()>;

    async fn start(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()>;

    /// Stop with a 30-second grace timeout.
    async fn stop(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()>;

    async fn restart(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()>;

    async fn status(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<WorkloadStatus>;

    /// First non-empty address across the workload's attached networks.
    async fn workload_ip(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<Option<String>>;

    async fn logs(&self, ctx: &OpCtx, id: &WorkloadId, options: LogOptions) -> Result<LogStream>;

    /// Apply online changes. Image changes are rejected with a
    /// non-retryable error requesting recreation.
    async fn update(&self, ctx: &OpCtx, id: &WorkloadId, update: &WorkloadUpdate) -> Result<()>;

    /// Every managed workload on the substrate, with computed status.
    /// Objects missing the workload-id label are skipped.
    async fn list(&self, ctx: &OpCtx) -> Result<Vec<WorkloadStatus>>;

    /// Probe the substrate within a 2-second bound.
    async fn health_check(&self, ctx: &OpCtx) -> Result<()>;

    /// Release network connections and background resources.
    async fn close(&self) -> Result<()>;

    /// Substrate family this driver drives.
    fn kind(&self) -> SubstrateKind;
}

/// Control surface for one-shot jobs (backtests and hyperopts).
#[async_trait]
pub trait JobController: Send + Sync {
    /// Start a backtest. The substrate object persists after exit so
    /// results can be extracted.
    async fn start_backtest(&self, ctx: &OpCtx, spec: &BacktestSpec) -> Result<SubstrateHandle>;

    async fn start_hyperopt(&self, ctx: &OpCtx, spec: &HyperoptSpec) -> Result<SubstrateHandle>;

    async fn status(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<JobStatus>;

    /// Extract the structured backtest result. Requires terminal status;
    /// extraction failures surface logs in the result, not as an error.
    async fn backtest_result(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<BacktestResult>;

    async fn hyperopt_result(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<HyperoptResult>;

    async fn logs(&self, ctx: &OpCtx, id: &WorkloadId, options: LogOptions) -> Result<LogStream>;

    async fn stop(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()>;

    /// Force-remove the job object and its results volume. Idempotent.
    async fn delete(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()>;

    async fn list(&self, ctx: &OpCtx) -> Result<Vec<JobStatus>>;

    async fn health_check(&self, ctx: &OpCtx) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn kind(&self) -> SubstrateKind;
}

/// Identifier of an in-flight data-download task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadTaskId(String);

impl DownloadTaskId {
    /// Wrap a substrate task identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DownloadTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Observed status of a data-download task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadStatus {
    pub state: DownloadState,
    #[serde(default)]
    pub progress: DownloadProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Parsed availability manifest, once the task completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<AvailableData>,
}

/// Control surface for historical-data download tasks.
#[async_trait]
pub trait DataDownloadController: Send + Sync {
    /// Compose and launch the download script on the runner's substrate.
    async fn start_download(&self, ctx: &OpCtx, spec: &DataDownloadSpec) -> Result<DownloadTaskId>;

    async fn status(&self, ctx: &OpCtx, task: &DownloadTaskId) -> Result<DownloadStatus>;

    async fn logs(&self, ctx: &OpCtx, task: &DownloadTaskId, options: LogOptions)
        -> Result<LogStream>;

    async fn cancel(&self, ctx: &OpCtx, task: &DownloadTaskId) -> Result<()>;

    /// Remove the task object and scratch artifacts. Idempotent.
    async fn cleanup(&self, ctx: &OpCtx, task: &DownloadTaskId) -> Result<()>;

    async fn health_check(&self, ctx: &OpCtx) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn kind(&self) -> SubstrateKind;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn guard_passes_through_completed_work() {
        let ctx = OpCtx::new();
        let out = ctx.guard("noop", async { 7 }).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn guard_aborts_on_cancellation() {
        let token = CancellationToken::new();
        let ctx = OpCtx::with_cancel(token.clone());
        token.cancel();

        let err = ctx
            .guard("create", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await
            .unwrap_err();
        assert_eq!(err.operation(), "create");
        assert!(!err.is_retryable());
    }
}
