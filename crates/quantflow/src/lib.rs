// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # QuantFlow core
//!
//! Substrate-agnostic scheduling and lifecycle engine for trading
//! workloads. This crate is the seam between the control plane and the
//! substrate drivers: it defines the workload spec and status model, the
//! capability interfaces drivers implement, the driver registry and
//! factory, the lifecycle state machine, and the injection-safe string
//! handling every driver shares.
//!
//! # Architecture
//!
//! - A caller builds a [`BotSpec`] (or a one-shot job spec) and hands it
//!   with the runner's opaque config map to the [`DriverRegistry`].
//! - The registry extracts and validates the substrate-specific subtree,
//!   constructs a driver and probes its substrate before returning it.
//! - The driver materializes config and code artifacts on the substrate,
//!   issues the substrate's create/start primitives and returns a
//!   [`SubstrateHandle`]; later calls address that handle.
//! - One-shot jobs poll until terminal, then extract structured results
//!   from substrate-resident storage.
//!
//! Substrate drivers live in their own crates (`quantflow-docker`,
//! `quantflow-kube`, `quantflow-local`) and register themselves into
//! [`DriverRegistry::global`] at process start.
//!
//! # Example
//!
//! ```rust,ignore
//! use quantflow::{DriverRegistry, OpCtx};
//!
//! quantflow_docker::register(DriverRegistry::global());
//!
//! let ctx = OpCtx::new();
//! let controller = DriverRegistry::global()
//!     .workload_controller(&ctx, runner.kind.tag(), &runner.config)
//!     .await?;
//! let handle = controller.create(&ctx, &spec).await?;
//! ```

pub mod config;
pub mod controller;
pub mod download;
pub mod error;
pub mod jobs;
pub mod layout;
pub mod lifecycle;
pub mod logs;
pub mod naming;
pub mod registry;
pub mod repository;
pub mod results;
pub mod runner;
pub mod sanitize;
pub mod secrets;
pub mod status;
pub mod workload;

pub use config::{
    DockerRunnerConfig, KubeRunnerConfig, LocalRunnerConfig, ObjectStorageConfig, RegistryAuth,
    SubstrateConfig, SubstrateKind,
};
pub use controller::{
    DataDownloadController, DownloadStatus, DownloadTaskId, JobController, OpCtx,
    WorkloadController,
};
pub use error::{Error, ErrorKind, Result};
pub use jobs::{BacktestSpec, DataDownloadSpec, ExchangeDownload, HyperoptSpec, MarketMode};
pub use lifecycle::LifecycleEngine;
pub use logs::{LogEntry, LogOptions, LogSource, LogStream};
pub use registry::{DriverProvider, DriverRegistry};
pub use repository::{MemoryRunnerRepository, RepoCtx, RunnerRepository};
pub use results::{BacktestMetrics, BacktestResult, HyperoptResult};
pub use runner::{
    AvailableData, BillingRates, DownloadProgress, DownloadState, Runner, RunnerDataState,
    TimeframeRange,
};
pub use status::{EpochProgress, JobState, JobStatus, ResourceUsage, WorkloadState, WorkloadStatus};
pub use workload::{
    BotSpec, ConfigLayerKind, ConfigLayers, ResourceLimits, RunnerId, SubstrateHandle, WorkloadId,
    WorkloadUpdate,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::controller::{
        DataDownloadController, JobController, OpCtx, WorkloadController,
    };
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::jobs::{BacktestSpec, DataDownloadSpec, HyperoptSpec};
    pub use crate::registry::DriverRegistry;
    pub use crate::status::{JobState, WorkloadState};
    pub use crate::workload::{BotSpec, SubstrateHandle, WorkloadId};
}
