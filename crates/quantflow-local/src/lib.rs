// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Local substrate stub
//!
//! Satisfies all three capability interfaces so the factory covers every
//! substrate tag at compile time, but fails every operation with a
//! non-retryable "not yet supported" error. Keeping the stub trivially
//! correct-by-construction beats shipping a half-working process host.

use std::sync::Arc;

use async_trait::async_trait;

use quantflow::error::{Error, ErrorKind, Result};
use quantflow::jobs::{BacktestSpec, DataDownloadSpec, HyperoptSpec};
use quantflow::logs::{LogOptions, LogStream};
use quantflow::results::{BacktestResult, HyperoptResult};
use quantflow::status::{JobStatus, WorkloadStatus};
use quantflow::workload::{BotSpec, SubstrateHandle, WorkloadId, WorkloadUpdate};
use quantflow::{
    DataDownloadController, DownloadStatus, DownloadTaskId, DriverProvider, DriverRegistry,
    JobController, OpCtx, SubstrateConfig, SubstrateKind, WorkloadController,
};

/// Register the local stub with a registry.
pub fn register(registry: &DriverRegistry) {
    registry.register(Arc::new(LocalProvider));
}

fn not_supported(operation: &str) -> Error {
    Error::new(operation, ErrorKind::NotSupported { substrate: "local" })
}

/// Factory for the local stub.
pub struct LocalProvider;

#[async_trait]
impl DriverProvider for LocalProvider {
    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Local
    }

    async fn workload_controller(
        &self,
        _ctx: &OpCtx,
        config: &SubstrateConfig,
    ) -> Result<Arc<dyn WorkloadController>> {
        config.validate()?;
        Ok(Arc::new(LocalStub))
    }

    async fn job_controller(
        &self,
        _ctx: &OpCtx,
        config: &SubstrateConfig,
    ) -> Result<Arc<dyn JobController>> {
        config.validate()?;
        Ok(Arc::new(LocalStub))
    }

    async fn data_download_controller(
        &self,
        _ctx: &OpCtx,
        config: &SubstrateConfig,
    ) -> Result<Arc<dyn DataDownloadController>> {
        config.validate()?;
        Ok(Arc::new(LocalStub))
    }
}

/// The stub driver. Every operation fails with
/// [`ErrorKind::NotSupported`].
pub struct LocalStub;

#[async_trait]
impl WorkloadController for LocalStub {
    async fn create(&self, _ctx: &OpCtx, _spec: &BotSpec) -> Result<SubstrateHandle> {
        Err(not_supported("create"))
    }

    async fn delete(&self, _ctx: &OpCtx, _id: &WorkloadId) -> Result<()> {
        Err(not_supported("delete"))
    }

    async fn start(&self, _ctx: &OpCtx, _id: &WorkloadId) -> Result<()> {
        Err(not_supported("start"))
    }

    async fn stop(&self, _ctx: &OpCtx, _id: &WorkloadId) -> Result<()> {
        Err(not_supported("stop"))
    }

    async fn restart(&self, _ctx: &OpCtx, _id: &WorkloadId) -> Result<()> {
        Err(not_supported("restart"))
    }

    async fn status(&self, _ctx: &OpCtx, _id: &WorkloadId) -> Result<WorkloadStatus> {
        Err(not_supported("get-status"))
    }

    async fn workload_ip(&self, _ctx: &OpCtx, _id: &WorkloadId) -> Result<Option<String>> {
        Err(not_supported("get-workload-ip"))
    }

    async fn logs(&self, _ctx: &OpCtx, _id: &WorkloadId, _options: LogOptions) -> Result<LogStream> {
        Err(not_supported("get-logs"))
    }

    async fn update(&self, _ctx: &OpCtx, _id: &WorkloadId, _update: &WorkloadUpdate) -> Result<()> {
        Err(not_supported("update"))
    }

    async fn list(&self, _ctx: &OpCtx) -> Result<Vec<WorkloadStatus>> {
        Err(not_supported("list"))
    }

    async fn health_check(&self, _ctx: &OpCtx) -> Result<()> {
        // The local substrate is always reachable; construction succeeds
        // so the stub can report "not yet supported" per operation.
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Local
    }
}

#[async_trait]
impl JobController for LocalStub {
    async fn start_backtest(&self, _ctx: &OpCtx, _spec: &BacktestSpec) -> Result<SubstrateHandle> {
        Err(not_supported("start-backtest"))
    }

    async fn start_hyperopt(&self, _ctx: &OpCtx, _spec: &HyperoptSpec) -> Result<SubstrateHandle> {
        Err(not_supported("start-hyperopt"))
    }

    async fn status(&self, _ctx: &OpCtx, _id: &WorkloadId) -> Result<JobStatus> {
        Err(not_supported("get-status"))
    }

    async fn backtest_result(&self, _ctx: &OpCtx, _id: &WorkloadId) -> Result<BacktestResult> {
        Err(not_supported("get-result"))
    }

    async fn hyperopt_result(&self, _ctx: &OpCtx, _id: &WorkloadId) -> Result<HyperoptResult> {
        Err(not_supported("get-result"))
    }

    async fn logs(&self, _ctx: &OpCtx, _id: &WorkloadId, _options: LogOptions) -> Result<LogStream> {
        Err(not_supported("get-logs"))
    }

    async fn stop(&self, _ctx: &OpCtx, _id: &WorkloadId) -> Result<()> {
        Err(not_supported("stop"))
    }

    async fn delete(&self, _ctx: &OpCtx, _id: &WorkloadId) -> Result<()> {
        Err(not_supported("delete"))
    }

    async fn list(&self, _ctx: &OpCtx) -> Result<Vec<JobStatus>> {
        Err(not_supported("list"))
    }

    async fn health_check(&self, _ctx: &OpCtx) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Local
    }
}

#[async_trait]
impl DataDownloadController for LocalStub {
    async fn start_download(&self, _ctx: &OpCtx, _spec: &DataDownloadSpec) -> Result<DownloadTaskId> {
        Err(not_supported("start-download"))
    }

    async fn status(&self, _ctx: &OpCtx, _task: &DownloadTaskId) -> Result<DownloadStatus> {
        Err(not_supported("get-status"))
    }

    async fn logs(
        &self,
        _ctx: &OpCtx,
        _task: &DownloadTaskId,
        _options: LogOptions,
    ) -> Result<LogStream> {
        Err(not_supported("get-logs"))
    }

    async fn cancel(&self, _ctx: &OpCtx, _task: &DownloadTaskId) -> Result<()> {
        Err(not_supported("cancel"))
    }

    async fn cleanup(&self, _ctx: &OpCtx, _task: &DownloadTaskId) -> Result<()> {
        Err(not_supported("cleanup"))
    }

    async fn health_check(&self, _ctx: &OpCtx) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_operation_is_not_supported() {
        let stub = LocalStub;
        let ctx = OpCtx::new();
        let id = WorkloadId::random();

        let err = WorkloadController::start(&stub, &ctx, &id).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NotSupported { substrate: "local" }));
        assert!(!err.is_retryable());

        let err = JobController::delete(&stub, &ctx, &id).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NotSupported { .. }));

        let task = DownloadTaskId::new(id.to_string());
        let err = DataDownloadController::cancel(&stub, &ctx, &task).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NotSupported { .. }));
    }

    #[tokio::test]
    async fn provider_registers_and_constructs() {
        let registry = DriverRegistry::new();
        register(&registry);

        let config = match serde_json::json!({"base_path": "/var/lib/quantflow"}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let controller =
            registry.workload_controller(&OpCtx::new(), "local", &config).await.unwrap();
        assert_eq!(controller.kind(), SubstrateKind::Local);
    }
}
