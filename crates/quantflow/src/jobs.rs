// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! One-shot job specifications: backtests, hyperopts, data downloads

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::workload::{ResourceLimits, RunnerId, WorkloadId};

/// Declarative specification of a backtest run.
///
/// The two configuration layers are fed to the workload runtime as two
/// `--config` files merged in order; the driver injects `dry_run = true`
/// unconditionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSpec {
    pub id: WorkloadId,
    /// Strategy class name; must match `^[A-Z][A-Za-z0-9]*$`.
    pub strategy: String,
    pub strategy_code: String,
    /// Strategy-layer configuration, merged first.
    #[serde(default)]
    pub strategy_config: Map<String, Value>,
    /// Backtest-layer configuration, merged second.
    #[serde(default)]
    pub backtest_config: Map<String, Value>,
    /// Workload image (version-pinned by the caller).
    pub image: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Presigned GET URL of the historical-data bundle to run against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_url: Option<String>,
}

impl BacktestSpec {
    /// Reject the spec before any side effect.
    pub fn validate(&self) -> Result<()> {
        validate_job_common("start-backtest", &self.id, &self.strategy, &self.strategy_code, &self.image)
    }

    /// The merged configuration document the driver materializes, with the
    /// dry-run guard injected last so it cannot be overridden.
    #[must_use]
    pub fn merged_config(&self) -> Map<String, Value> {
        let mut merged = self.strategy_config.clone();
        for (key, value) in &self.backtest_config {
            merged.insert(key.clone(), value.clone());
        }
        merged.insert("dry_run".to_string(), Value::Bool(true));
        merged
    }
}

/// Declarative specification of a hyperparameter-optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperoptSpec {
    /// The backtest shape the hyperopt builds on.
    #[serde(flatten)]
    pub backtest: BacktestSpec,
    /// Number of optimization epochs. Must be at least one.
    pub epochs: u32,
    /// Optimization spaces, e.g. `["buy", "sell", "roi"]`.
    pub spaces: Vec<String>,
    /// Loss-function identifier understood by the workload runtime.
    pub loss: String,
}

impl HyperoptSpec {
    /// Reject the spec before any side effect.
    pub fn validate(&self) -> Result<()> {
        validate_job_common(
            "start-hyperopt",
            &self.backtest.id,
            &self.backtest.strategy,
            &self.backtest.strategy_code,
            &self.backtest.image,
        )?;
        if self.epochs == 0 {
            return Err(Error::validation("start-hyperopt", "epoch count must be at least 1")
                .with_workload(self.backtest.id));
        }
        if self.spaces.is_empty() {
            return Err(Error::validation("start-hyperopt", "at least one optimization space is required")
                .with_workload(self.backtest.id));
        }
        if self.loss.trim().is_empty() {
            return Err(Error::validation("start-hyperopt", "loss-function identifier is empty")
                .with_workload(self.backtest.id));
        }
        Ok(())
    }
}

fn validate_job_common(
    operation: &str,
    id: &WorkloadId,
    strategy: &str,
    strategy_code: &str,
    image: &str,
) -> Result<()> {
    if image.trim().is_empty() {
        return Err(Error::validation(operation, "workload image is empty").with_workload(*id));
    }
    if !crate::workload::strategy_name_is_valid(strategy) {
        return Err(Error::validation(
            operation,
            format!("strategy name '{strategy}' is not a PascalCase identifier"),
        )
        .with_workload(*id));
    }
    if strategy_code.trim().is_empty() {
        return Err(Error::validation(operation, "strategy source is empty").with_workload(*id));
    }
    Ok(())
}

/// Market mode of a per-exchange download entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketMode {
    Spot,
    Futures,
}

impl MarketMode {
    /// Argument value passed to the workload download verb.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketMode::Spot => "spot",
            MarketMode::Futures => "futures",
        }
    }
}

/// One exchange's worth of a data-download task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeDownload {
    /// Exchange name as the workload runtime knows it, e.g. `binance`.
    pub exchange: String,
    /// Symbol pattern, e.g. `.*/USDT`.
    pub pairs: String,
    /// Candle timeframes to fetch, e.g. `["5m", "1h"]`.
    pub timeframes: Vec<String>,
    /// How many days back to fetch.
    pub days: u32,
    pub mode: MarketMode,
}

/// Declarative specification of a historical-data download task.
///
/// The download runs on the runner's own substrate, never on the
/// orchestrator host; results move through object storage via presigned
/// URLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDownloadSpec {
    pub id: WorkloadId,
    pub runner: RunnerId,
    /// Presigned GET URL of an existing bundle for incremental updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_data_url: Option<String>,
    /// Presigned PUT URL the packaged archive is uploaded to.
    pub upload_url: String,
    /// Workload image whose download verb and scripting runtime are used.
    pub image: String,
    /// Per-exchange download entries. At least one is required.
    pub exchanges: Vec<ExchangeDownload>,
}

impl DataDownloadSpec {
    /// Reject the spec before any side effect.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::validation("start-download", "workload image is empty")
                .with_workload(self.id));
        }
        if self.upload_url.trim().is_empty() {
            return Err(Error::validation("start-download", "upload URL is empty")
                .with_workload(self.id));
        }
        if self.exchanges.is_empty() {
            return Err(Error::validation("start-download", "at least one exchange entry is required")
                .with_workload(self.id));
        }
        for entry in &self.exchanges {
            if entry.exchange.trim().is_empty() {
                return Err(Error::validation("start-download", "exchange name is empty")
                    .with_workload(self.id));
            }
            if entry.timeframes.is_empty() {
                return Err(Error::validation(
                    "start-download",
                    format!("no timeframes configured for exchange '{}'", entry.exchange),
                )
                .with_workload(self.id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_backtest() -> BacktestSpec {
        BacktestSpec {
            id: WorkloadId::random(),
            strategy: "SampleStrategy".into(),
            strategy_code: "class SampleStrategy:\n    pass\n".into(),
            strategy_config: match json!({"timeframe": "1h", "dry_run": false}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            },
            backtest_config: match json!({"timerange": "20240101-20240301"}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            },
            image: "freqtradeorg/freqtrade:2024.2".into(),
            env: HashMap::new(),
            limits: ResourceLimits::default(),
            data_url: None,
        }
    }

    pub(crate) fn sample_download() -> DataDownloadSpec {
        DataDownloadSpec {
            id: WorkloadId::random(),
            runner: RunnerId::random(),
            existing_data_url: None,
            upload_url: "https://storage.example/bundle?sig=abc".into(),
            image: "freqtradeorg/freqtrade:stable".into(),
            exchanges: vec![ExchangeDownload {
                exchange: "binance".into(),
                pairs: ".*/USDT".into(),
                timeframes: vec!["5m".into(), "1h".into()],
                days: 30,
                mode: MarketMode::Spot,
            }],
        }
    }

    #[test]
    fn merged_config_injects_dry_run_last() {
        let spec = sample_backtest();
        let merged = spec.merged_config();
        // The user tried to turn dry-run off in the strategy layer; the
        // injected guard wins.
        assert_eq!(merged["dry_run"], Value::Bool(true));
        assert_eq!(merged["timeframe"], "1h");
        assert_eq!(merged["timerange"], "20240101-20240301");
    }

    #[test]
    fn backtest_layer_overrides_strategy_layer() {
        let mut spec = sample_backtest();
        spec.backtest_config.insert("timeframe".into(), Value::String("4h".into()));
        assert_eq!(spec.merged_config()["timeframe"], "4h");
    }

    #[test]
    fn hyperopt_validation() {
        let good = HyperoptSpec {
            backtest: sample_backtest(),
            epochs: 100,
            spaces: vec!["buy".into(), "sell".into()],
            loss: "SharpeHyperOptLoss".into(),
        };
        good.validate().unwrap();

        let zero_epochs = HyperoptSpec { epochs: 0, ..good.clone() };
        assert!(zero_epochs.validate().is_err());

        let no_spaces = HyperoptSpec { spaces: vec![], ..good };
        assert!(no_spaces.validate().is_err());
    }

    #[test]
    fn download_validation_requires_exchanges() {
        let mut spec = sample_download();
        spec.validate().unwrap();

        spec.exchanges.clear();
        assert!(spec.validate().is_err());
    }
}
