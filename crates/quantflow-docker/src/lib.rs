// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Container-daemon substrate driver for QuantFlow
//!
//! Drives workloads on a local or remote container daemon:
//!
//! - [`DockerWorkloads`] — long-running bot control
//! - [`DockerJobs`] — one-shot backtests and hyperopts with result
//!   extraction from the per-job results volume
//! - [`DockerDataDownloads`] — historical-data download tasks
//! - [`VolumeHelper`] — the single correct way to touch daemon-resident
//!   filesystem state from the orchestrator
//!
//! The daemon endpoint scheme decides the filesystem model at
//! construction: a unix socket means the operator host and substrate host
//! are the same and artifacts can be bind-mounted; anything else goes
//! through named volumes and disposable helper containers. Pretending a
//! bind mount works against a remote daemon is the classic failure mode —
//! the path is simply meaningless on the other host.
//!
//! # Example
//!
//! ```rust,ignore
//! use quantflow::{DriverRegistry, OpCtx};
//!
//! quantflow_docker::register(DriverRegistry::global());
//!
//! let controller = DriverRegistry::global()
//!     .workload_controller(&OpCtx::new(), "container-daemon", &runner.config)
//!     .await?;
//! ```

pub mod client;
pub mod data;
pub mod demux;
pub mod jobs;
mod logstream;
pub mod stats;
pub mod volumes;
pub mod workloads;

use std::sync::Arc;

use async_trait::async_trait;

use quantflow::error::{Error, ErrorKind, Result};
use quantflow::{
    DataDownloadController, DriverProvider, DriverRegistry, JobController, OpCtx, SubstrateConfig,
    SubstrateKind, WorkloadController,
};

pub use client::DockerClient;
pub use data::DockerDataDownloads;
pub use demux::{demux_all, stdout_bytes, Demuxer, Frame, StdStream};
pub use jobs::DockerJobs;
pub use volumes::VolumeHelper;
pub use workloads::DockerWorkloads;

/// Register the container-daemon driver with a registry.
///
/// Call once at process start; typically against
/// [`DriverRegistry::global`].
pub fn register(registry: &DriverRegistry) {
    registry.register(Arc::new(DockerProvider));
}

/// Factory for container-daemon drivers.
///
/// Construction connects and probes the daemon; callers only ever see a
/// driver that has answered a ping.
pub struct DockerProvider;

impl DockerProvider {
    async fn connect(&self, ctx: &OpCtx, config: &SubstrateConfig) -> Result<DockerClient> {
        let SubstrateConfig::Docker(docker_config) = config else {
            return Err(Error::new(
                "construct-driver",
                ErrorKind::UnsupportedSubstrate(config.kind().tag().to_string()),
            ));
        };
        let client = DockerClient::connect(docker_config)?;
        client.health_check(ctx).await?;
        Ok(client)
    }
}

#[async_trait]
impl DriverProvider for DockerProvider {
    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Docker
    }

    async fn workload_controller(
        &self,
        ctx: &OpCtx,
        config: &SubstrateConfig,
    ) -> Result<Arc<dyn WorkloadController>> {
        let client = self.connect(ctx, config).await?;
        Ok(Arc::new(DockerWorkloads::new(client)))
    }

    async fn job_controller(
        &self,
        ctx: &OpCtx,
        config: &SubstrateConfig,
    ) -> Result<Arc<dyn JobController>> {
        let client = self.connect(ctx, config).await?;
        Ok(Arc::new(DockerJobs::new(client)))
    }

    async fn data_download_controller(
        &self,
        ctx: &OpCtx,
        config: &SubstrateConfig,
    ) -> Result<Arc<dyn DataDownloadController>> {
        let client = self.connect(ctx, config).await?;
        Ok(Arc::new(DockerDataDownloads::new(client)))
    }
}
