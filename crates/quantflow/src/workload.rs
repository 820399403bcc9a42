// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Declarative workload specifications
//!
//! A [`BotSpec`] is value-typed and constructed per operation; the substrate
//! takes ownership of whatever the driver materializes from it. Identifiers
//! are UUIDs chosen by the caller, which keeps create idempotent under
//! retries (the derived object name collides instead of duplicating).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

#[allow(clippy::unwrap_used)] // literal pattern
static STRATEGY_NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new("^[A-Z][A-Za-z0-9]*$").unwrap());

/// Whether a name is already a valid PascalCase strategy identifier.
///
/// Free-form names go through [`crate::sanitize::strategy_class_name`]
/// first; this check is the post-sanitization invariant.
#[must_use]
pub fn strategy_name_is_valid(name: &str) -> bool {
    STRATEGY_NAME_RE.is_match(name)
}

/// Caller-chosen workload identifier (bot or one-shot job).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadId(Uuid);

impl WorkloadId {
    /// Wrap an existing UUID.
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generate a fresh random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for WorkloadId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier of a registered runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunnerId(Uuid);

impl RunnerId {
    /// Wrap an existing UUID.
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generate a fresh random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunnerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Opaque substrate-side handle of a created object (container id, pod uid).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubstrateHandle(String);

impl SubstrateHandle {
    /// Wrap a substrate-native identifier.
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// The raw substrate identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubstrateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The four configuration layers of a bot, in overlay order.
///
/// The workload runtime merges the emitted `--config` files left to right;
/// later values override earlier ones. [`ConfigLayerKind::Secure`] is
/// written by the orchestrator, never by the user, and its last position is
/// a security property: it carries the API-server binding and policy flags
/// the operator must not be able to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLayerKind {
    Exchange,
    Strategy,
    Bot,
    Secure,
}

impl ConfigLayerKind {
    /// The fixed overlay order. Secure is last; re-ordering breaks the
    /// override guarantee and must fail the layering tests.
    pub const ORDER: [ConfigLayerKind; 4] = [
        ConfigLayerKind::Exchange,
        ConfigLayerKind::Strategy,
        ConfigLayerKind::Bot,
        ConfigLayerKind::Secure,
    ];

    /// File name of this layer under the workload directory.
    #[must_use]
    pub fn file_name(&self) -> &'static str {
        match self {
            ConfigLayerKind::Exchange => "config.exchange.json",
            ConfigLayerKind::Strategy => "config.strategy.json",
            ConfigLayerKind::Bot => "config.bot.json",
            ConfigLayerKind::Secure => "config.secure.json",
        }
    }
}

/// The four independent configuration documents of a bot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigLayers {
    /// Exchange connectivity: venue name, API key and secret.
    #[serde(default)]
    pub exchange: Map<String, Value>,
    /// Strategy parameters: timeframe, indicator settings.
    #[serde(default)]
    pub strategy: Map<String, Value>,
    /// Bot behavior: stake sizing, pair lists.
    #[serde(default)]
    pub bot: Map<String, Value>,
    /// System-forced overrides. Built by [`ConfigLayers::with_secure_defaults`].
    #[serde(default)]
    pub secure: Map<String, Value>,
}

impl ConfigLayers {
    /// The layers in overlay order, paired with their kind.
    #[must_use]
    pub fn ordered(&self) -> [(ConfigLayerKind, &Map<String, Value>); 4] {
        [
            (ConfigLayerKind::Exchange, &self.exchange),
            (ConfigLayerKind::Strategy, &self.strategy),
            (ConfigLayerKind::Bot, &self.bot),
            (ConfigLayerKind::Secure, &self.secure),
        ]
    }

    /// Whether at least one user-supplied layer has content.
    #[must_use]
    pub fn has_user_content(&self) -> bool {
        !(self.exchange.is_empty() && self.strategy.is_empty() && self.bot.is_empty())
    }

    /// Install the system-forced secure layer.
    ///
    /// Binds the workload API server to all interfaces on `api_port` and
    /// forces the initial state to running. Whatever the user wrote into
    /// other layers for these paths is overridden because this layer merges
    /// last.
    #[must_use]
    pub fn with_secure_defaults(mut self, api_port: u16) -> Self {
        let secure = json!({
            "api_server": {
                "enabled": true,
                "listen_ip_address": "0.0.0.0",
                "listen_port": api_port,
            },
            "initial_state": "running",
        });
        if let Value::Object(map) = secure {
            self.secure = map;
        }
        self
    }
}

/// Resource limits applied to a workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes. `None` leaves the substrate default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<i64>,
    /// CPU ceiling as a fraction of one CPU (0.5 = half a core).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
}

/// CPU quota period used when translating [`ResourceLimits::cpus`] for a
/// container daemon, in microseconds.
pub const CPU_QUOTA_PERIOD_US: i64 = 100_000;

impl ResourceLimits {
    /// CPU quota in microseconds over [`CPU_QUOTA_PERIOD_US`].
    #[must_use]
    pub fn cpu_quota_us(&self) -> Option<i64> {
        self.cpus.map(|cpus| (cpus * CPU_QUOTA_PERIOD_US as f64) as i64)
    }
}

/// Declarative specification of a long-running trading bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotSpec {
    /// Caller-chosen identifier; the substrate object name derives from it.
    pub id: WorkloadId,
    /// Human-readable display name.
    pub name: String,
    /// Workload container image.
    pub image: String,
    /// Strategy class name; must match `^[A-Z][A-Za-z0-9]*$`.
    pub strategy: String,
    /// Strategy source code, materialized under `strategies/<name>.py`.
    pub strategy_code: String,
    /// The four configuration layers.
    #[serde(default)]
    pub config: ConfigLayers,
    /// Extra environment for the workload process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Network selector; the driver default network applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Port the workload API server listens on inside the workload.
    pub api_port: u16,
}

impl BotSpec {
    /// Reject the spec before any side effect.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::validation("create", "workload image is empty")
                .with_workload(self.id));
        }
        if !STRATEGY_NAME_RE.is_match(&self.strategy) {
            return Err(Error::validation(
                "create",
                format!("strategy name '{}' is not a PascalCase identifier", self.strategy),
            )
            .with_workload(self.id));
        }
        if self.strategy_code.trim().is_empty() {
            return Err(Error::validation("create", "strategy source is empty")
                .with_workload(self.id));
        }
        if !self.config.has_user_content() {
            return Err(Error::validation(
                "create",
                "at least one non-empty configuration layer is required",
            )
            .with_workload(self.id));
        }
        Ok(())
    }

    /// Filename of the materialized strategy module.
    #[must_use]
    pub fn strategy_file_name(&self) -> String {
        format!("{}.py", self.strategy)
    }
}

/// Online changes applicable to a running workload.
///
/// Only resource limits can change in place; an image change requires
/// recreation and is rejected with a non-retryable error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_spec() -> BotSpec {
        BotSpec {
            id: WorkloadId::random(),
            name: "demo bot".into(),
            image: "freqtradeorg/freqtrade:stable".into(),
            strategy: "SampleStrategy".into(),
            strategy_code: "class SampleStrategy:\n    pass\n".into(),
            config: ConfigLayers {
                exchange: serde_json::from_value(serde_json::json!({
                    "exchange": {"name": "binance", "key": "K", "secret": "S"}
                }))
                .unwrap(),
                strategy: serde_json::from_value(serde_json::json!({"timeframe": "1h"})).unwrap(),
                bot: serde_json::from_value(serde_json::json!({"stake_amount": 100})).unwrap(),
                secure: Map::new(),
            },
            env: HashMap::new(),
            limits: ResourceLimits { memory_bytes: Some(512 * 1024 * 1024), cpus: Some(0.5) },
            network: None,
            api_port: 8080,
        }
    }

    #[test]
    fn valid_spec_passes() {
        sample_spec().validate().unwrap();
    }

    #[test]
    fn layer_order_is_exchange_strategy_bot_secure() {
        let layers = ConfigLayers::default().with_secure_defaults(8080);
        let kinds: Vec<_> = layers.ordered().iter().map(|(kind, _)| *kind).collect();
        assert_eq!(
            kinds,
            vec![
                ConfigLayerKind::Exchange,
                ConfigLayerKind::Strategy,
                ConfigLayerKind::Bot,
                ConfigLayerKind::Secure,
            ]
        );
        // The overlay order is a security property: secure must be last so
        // the system-forced values win the merge.
        assert_eq!(kinds, ConfigLayerKind::ORDER.to_vec());
        assert_eq!(kinds.last(), Some(&ConfigLayerKind::Secure));
    }

    #[test]
    fn secure_layer_forces_api_binding() {
        let layers = ConfigLayers::default().with_secure_defaults(9091);
        assert_eq!(layers.secure["api_server"]["listen_port"], 9091);
        assert_eq!(layers.secure["api_server"]["listen_ip_address"], "0.0.0.0");
        assert_eq!(layers.secure["initial_state"], "running");
    }

    #[test]
    fn rejects_non_pascal_strategy_names() {
        for bad in ["myStrategy", "9Lives", "Has Space", ""] {
            let spec = BotSpec { strategy: bad.into(), ..sample_spec() };
            let err = spec.validate().unwrap_err();
            assert!(!err.is_retryable(), "{bad} must be a validation failure");
        }
    }

    #[test]
    fn rejects_empty_config_layers() {
        let spec = BotSpec { config: ConfigLayers::default(), ..sample_spec() };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn cpu_quota_uses_hundred_ms_period() {
        let limits = ResourceLimits { memory_bytes: None, cpus: Some(1.5) };
        assert_eq!(limits.cpu_quota_us(), Some(150_000));
        assert_eq!(ResourceLimits::default().cpu_quota_us(), None);
    }
}
