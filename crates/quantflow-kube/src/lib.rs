// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Cluster substrate driver for QuantFlow
//!
//! Drives workloads on a Kubernetes cluster:
//!
//! - [`KubeWorkloads`] — bots as single-replica deployments with config
//!   objects and a NodePort API service
//! - [`KubeJobs`] — backtests and hyperopts as batch jobs with per-job
//!   results claims
//! - [`KubeDataDownloads`] — historical-data download jobs over the
//!   shared data claim
//! - [`KubeVolumeHelper`] — helper-pod reads of cluster-resident volumes
//!
//! Strategy source is chunked across config objects when it exceeds the
//! cluster's object size limit and reassembled by an init container; the
//! workload sees a single file. The cluster's own scheduler places every
//! pod — this driver delegates, it never schedules.
//!
//! # Example
//!
//! ```rust,ignore
//! use quantflow::{DriverRegistry, OpCtx};
//!
//! quantflow_kube::register(DriverRegistry::global());
//!
//! let controller = DriverRegistry::global()
//!     .workload_controller(&OpCtx::new(), "cluster", &runner.config)
//!     .await?;
//! ```

pub mod client;
pub mod data;
pub mod jobs;
mod metrics;
pub mod objects;
pub mod volumes;
pub mod workloads;

use std::sync::Arc;

use async_trait::async_trait;

use quantflow::error::{Error, ErrorKind, Result};
use quantflow::{
    DataDownloadController, DriverProvider, DriverRegistry, JobController, OpCtx, SubstrateConfig,
    SubstrateKind, WorkloadController,
};

pub use client::KubeClient;
pub use data::KubeDataDownloads;
pub use jobs::KubeJobs;
pub use volumes::KubeVolumeHelper;
pub use workloads::KubeWorkloads;

/// Register the cluster driver with a registry.
///
/// Call once at process start; typically against
/// [`DriverRegistry::global`].
pub fn register(registry: &DriverRegistry) {
    registry.register(Arc::new(KubeProvider));
}

/// Factory for cluster drivers.
///
/// Construction connects and probes the API server; callers only ever see
/// a driver that has answered a version request.
pub struct KubeProvider;

impl KubeProvider {
    async fn connect(&self, ctx: &OpCtx, config: &SubstrateConfig) -> Result<KubeClient> {
        let SubstrateConfig::Kubernetes(kube_config) = config else {
            return Err(Error::new(
                "construct-driver",
                ErrorKind::UnsupportedSubstrate(config.kind().tag().to_string()),
            ));
        };
        let client = KubeClient::connect(kube_config).await?;
        client.health_check(ctx).await?;
        Ok(client)
    }
}

#[async_trait]
impl DriverProvider for KubeProvider {
    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Kubernetes
    }

    async fn workload_controller(
        &self,
        ctx: &OpCtx,
        config: &SubstrateConfig,
    ) -> Result<Arc<dyn WorkloadController>> {
        let client = self.connect(ctx, config).await?;
        Ok(Arc::new(KubeWorkloads::new(client)))
    }

    async fn job_controller(
        &self,
        ctx: &OpCtx,
        config: &SubstrateConfig,
    ) -> Result<Arc<dyn JobController>> {
        let client = self.connect(ctx, config).await?;
        Ok(Arc::new(KubeJobs::new(client)))
    }

    async fn data_download_controller(
        &self,
        ctx: &OpCtx,
        config: &SubstrateConfig,
    ) -> Result<Arc<dyn DataDownloadController>> {
        let client = self.connect(ctx, config).await?;
        Ok(Arc::new(KubeDataDownloads::new(client)))
    }
}
