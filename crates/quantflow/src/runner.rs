// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The runner entity and its data state
//!
//! A runner is a persisted record describing how to reach one substrate.
//! It is soft-deleted: a non-null deletion timestamp makes it invisible to
//! ordinary queries and closes it to new workloads, while retaining the
//! identifier for audit and billing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{ObjectStorageConfig, SubstrateConfig, SubstrateKind};
use crate::error::Result;
use crate::workload::RunnerId;

/// Billing rates of a runner, when the owner charges for it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BillingRates {
    /// Price per bot-hour.
    pub bot_hourly: f64,
    /// Price per backtest run.
    pub per_backtest: f64,
}

/// A registered substrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runner {
    pub id: RunnerId,
    pub name: String,
    /// Owning organization scope.
    pub org: String,
    pub kind: SubstrateKind,
    /// Opaque substrate configuration mapping (flat or nested shape).
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Object storage used for historical-data distribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_storage: Option<ObjectStorageConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing: Option<BillingRates>,
    /// Whether the runner is visible outside its owning organization.
    #[serde(default)]
    pub public: bool,
    pub created_at: DateTime<Utc>,
    /// Soft-delete timestamp; set instead of removing the row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Runner {
    /// Whether the runner has been soft-deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// A tombstoned runner may not accept new workloads.
    #[must_use]
    pub fn accepts_workloads(&self) -> bool {
        !self.is_deleted()
    }

    /// Parse and validate the opaque config mapping for this runner's
    /// substrate.
    pub fn substrate_config(&self) -> Result<SubstrateConfig> {
        SubstrateConfig::from_map(self.kind, &self.config)
    }
}

/// Download phase of a runner's historical-data store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    #[default]
    Idle,
    Downloading,
    Completed,
    Failed,
}

/// Structured progress of an in-flight download.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Coarse completion estimate, 0 to 100, per-exchange granularity.
    pub percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_symbol: Option<String>,
    pub symbols_completed: u32,
    pub symbols_total: u32,
}

/// Candle availability of one symbol and timeframe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeframeRange {
    pub timeframe: String,
    /// First candle open time, milliseconds since epoch.
    pub from_ms: i64,
    /// Last candle open time, milliseconds since epoch.
    pub to_ms: i64,
}

/// Available-data manifest: exchange → symbol → timeframe ranges.
///
/// Emitted by the download script between sentinel lines and parsed out of
/// the captured logs; see [`crate::download`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AvailableData(pub BTreeMap<String, BTreeMap<String, Vec<TimeframeRange>>>);

impl AvailableData {
    /// Total number of (exchange, symbol) entries.
    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    /// Whether any data is available at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }
}

/// Data state of a runner, persisted next to the entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerDataState {
    /// Whether the shared historical-data volume is ready for jobs.
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub state: DownloadState,
    #[serde(default)]
    pub progress: DownloadProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<AvailableData>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_runner() -> Runner {
        Runner {
            id: RunnerId::random(),
            name: "team docker host".into(),
            org: "org-7".into(),
            kind: SubstrateKind::Docker,
            config: match json!({"endpoint": "unix:///var/run/docker.sock"}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            },
            object_storage: None,
            billing: None,
            public: false,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn tombstoned_runner_refuses_workloads() {
        let mut runner = sample_runner();
        assert!(runner.accepts_workloads());

        runner.deleted_at = Some(Utc::now());
        assert!(runner.is_deleted());
        assert!(!runner.accepts_workloads());
    }

    #[test]
    fn substrate_config_parses_from_entity() {
        let runner = sample_runner();
        let config = runner.substrate_config().unwrap();
        assert_eq!(config.kind(), SubstrateKind::Docker);
    }

    #[test]
    fn available_data_manifest_round_trips() {
        let manifest: AvailableData = serde_json::from_value(json!({
            "binance": {
                "BTC/USDT": [{"timeframe": "1h", "from_ms": 1704067200000i64, "to_ms": 1709251200000i64}],
                "ETH/USDT:USDT": [{"timeframe": "5m", "from_ms": 1706745600000i64, "to_ms": 1709251200000i64}]
            }
        }))
        .unwrap();
        assert_eq!(manifest.symbol_count(), 2);
        let reparsed: AvailableData =
            serde_json::from_value(serde_json::to_value(&manifest).unwrap()).unwrap();
        assert_eq!(manifest, reparsed);
    }
}
