// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Driver registry and factory
//!
//! Drivers register a [`DriverProvider`] keyed by substrate tag at process
//! start; the factory functions extract and validate the runner's opaque
//! config, look the provider up, construct a driver and probe its substrate
//! before handing it out. The caller only ever obtains a driver that has
//! successfully contacted its substrate.
//!
//! The registry is written during startup and read during operations; a
//! reader-preferring lock keeps the hot path contention-free.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{SubstrateConfig, SubstrateKind};
use crate::controller::{DataDownloadController, JobController, OpCtx, WorkloadController};
use crate::error::{Error, ErrorKind, Result};

/// Constructs drivers for one substrate family.
///
/// Construction is fallible and includes the health probe; a returned
/// controller has successfully contacted its substrate.
#[async_trait]
pub trait DriverProvider: Send + Sync {
    /// Substrate family this provider constructs drivers for.
    fn kind(&self) -> SubstrateKind;

    async fn workload_controller(
        &self,
        ctx: &OpCtx,
        config: &SubstrateConfig,
    ) -> Result<Arc<dyn WorkloadController>>;

    async fn job_controller(
        &self,
        ctx: &OpCtx,
        config: &SubstrateConfig,
    ) -> Result<Arc<dyn JobController>>;

    async fn data_download_controller(
        &self,
        ctx: &OpCtx,
        config: &SubstrateConfig,
    ) -> Result<Arc<dyn DataDownloadController>>;
}

/// Runtime-looked-up driver constructors, keyed by substrate tag.
#[derive(Default)]
pub struct DriverRegistry {
    providers: parking_lot::RwLock<HashMap<SubstrateKind, Arc<dyn DriverProvider>>>,
}

static GLOBAL: LazyLock<DriverRegistry> = LazyLock::new(DriverRegistry::default);

impl DriverRegistry {
    /// Fresh, empty registry. Tests use this; production code uses
    /// [`DriverRegistry::global`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry drivers self-register into at startup.
    #[must_use]
    pub fn global() -> &'static DriverRegistry {
        &GLOBAL
    }

    /// Register a provider for its substrate tag, replacing any previous
    /// registration.
    pub fn register(&self, provider: Arc<dyn DriverProvider>) {
        let kind = provider.kind();
        debug!(substrate = %kind, "registering driver provider");
        self.providers.write().insert(kind, provider);
    }

    /// Look up the provider for a substrate tag.
    pub fn provider(&self, kind: SubstrateKind) -> Result<Arc<dyn DriverProvider>> {
        self.providers.read().get(&kind).map(Arc::clone).ok_or_else(|| {
            Error::new("construct-driver", ErrorKind::UnsupportedSubstrate(kind.tag().to_string()))
        })
    }

    /// Registered substrate tags, for diagnostics.
    #[must_use]
    pub fn registered(&self) -> Vec<SubstrateKind> {
        self.providers.read().keys().copied().collect()
    }

    /// Construct a long-running workload controller for a runner.
    ///
    /// `tag` is the runner's substrate tag; `config` its opaque
    /// configuration mapping in either nested or flat shape.
    pub async fn workload_controller(
        &self,
        ctx: &OpCtx,
        tag: &str,
        config: &Map<String, Value>,
    ) -> Result<Arc<dyn WorkloadController>> {
        let (kind, parsed) = parse(tag, config)?;
        self.provider(kind)?.workload_controller(ctx, &parsed).await
    }

    /// Construct a one-shot job controller for a runner.
    pub async fn job_controller(
        &self,
        ctx: &OpCtx,
        tag: &str,
        config: &Map<String, Value>,
    ) -> Result<Arc<dyn JobController>> {
        let (kind, parsed) = parse(tag, config)?;
        self.provider(kind)?.job_controller(ctx, &parsed).await
    }

    /// Construct a data-download controller for a runner.
    pub async fn data_download_controller(
        &self,
        ctx: &OpCtx,
        tag: &str,
        config: &Map<String, Value>,
    ) -> Result<Arc<dyn DataDownloadController>> {
        let (kind, parsed) = parse(tag, config)?;
        self.provider(kind)?.data_download_controller(ctx, &parsed).await
    }
}

fn parse(tag: &str, config: &Map<String, Value>) -> Result<(SubstrateKind, SubstrateConfig)> {
    let kind = SubstrateKind::from_tag(tag)?;
    let parsed = SubstrateConfig::from_map(kind, config)?;
    Ok((kind, parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullProvider(SubstrateKind);

    #[async_trait]
    impl DriverProvider for NullProvider {
        fn kind(&self) -> SubstrateKind {
            self.0
        }

        async fn workload_controller(
            &self,
            _ctx: &OpCtx,
            _config: &SubstrateConfig,
        ) -> Result<Arc<dyn WorkloadController>> {
            Err(Error::new("construct-driver", ErrorKind::Other("null provider".into())))
        }

        async fn job_controller(
            &self,
            _ctx: &OpCtx,
            _config: &SubstrateConfig,
        ) -> Result<Arc<dyn JobController>> {
            Err(Error::new("construct-driver", ErrorKind::Other("null provider".into())))
        }

        async fn data_download_controller(
            &self,
            _ctx: &OpCtx,
            _config: &SubstrateConfig,
        ) -> Result<Arc<dyn DataDownloadController>> {
            Err(Error::new("construct-driver", ErrorKind::Other("null provider".into())))
        }
    }

    #[tokio::test]
    async fn unknown_tag_is_unsupported() {
        let registry = DriverRegistry::new();
        let err = match registry.workload_controller(&OpCtx::new(), "nomad", &Map::new()).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err.kind(), ErrorKind::UnsupportedSubstrate(tag) if tag == "nomad"));
    }

    #[tokio::test]
    async fn known_tag_without_registration_is_unsupported() {
        let registry = DriverRegistry::new();
        let config = match serde_json::json!({"endpoint": "unix:///var/run/docker.sock"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let err = match registry.workload_controller(&OpCtx::new(), "container-daemon", &config).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err.kind(), ErrorKind::UnsupportedSubstrate(_)));
    }

    #[tokio::test]
    async fn registration_is_keyed_by_tag() {
        let registry = DriverRegistry::new();
        registry.register(Arc::new(NullProvider(SubstrateKind::Local)));
        assert_eq!(registry.registered(), vec![SubstrateKind::Local]);

        registry.provider(SubstrateKind::Local).unwrap();
        assert!(registry.provider(SubstrateKind::Docker).is_err());
    }

    #[tokio::test]
    async fn config_validation_happens_before_lookup() {
        let registry = DriverRegistry::new();
        registry.register(Arc::new(NullProvider(SubstrateKind::Kubernetes)));
        // Empty namespace: rejected before the provider is consulted.
        let config = match serde_json::json!({"namespace": ""}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let err = match registry.job_controller(&OpCtx::new(), "cluster", &config).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err.kind(), ErrorKind::Validation(_)));
    }
}
