// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Structured results of one-shot jobs
//!
//! Result extraction is best-effort by contract: when the structured
//! document cannot be read, the captured logs plus a descriptive error land
//! under [`EXTRACTION_ERROR_KEY`] in the raw-result map and the operation
//! still succeeds. The caller may well want the logs of a failed run more
//! than the metrics of a successful one.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::status::JobState;
use crate::workload::WorkloadId;

/// Key in the raw-result map under which extraction failures are surfaced.
pub const EXTRACTION_ERROR_KEY: &str = "extraction_error";

/// Performance metrics of a backtest run.
///
/// Every field is optional: the workload runtime's result schema drifts
/// across versions and a partially-parsed document is still useful.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub trades_total: Option<u64>,
    pub wins: Option<u64>,
    pub losses: Option<u64>,
    pub draws: Option<u64>,
    pub win_rate: Option<f64>,
    pub profit_factor: Option<f64>,
    pub profit_total: Option<f64>,
    pub profit_total_abs: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub sharpe: Option<f64>,
    pub sortino: Option<f64>,
    pub calmar: Option<f64>,
    pub expectancy: Option<f64>,
    pub best_trade: Option<f64>,
    pub worst_trade: Option<f64>,
    pub final_balance: Option<f64>,
}

impl BacktestMetrics {
    /// Pull the metric set out of a raw backtest result document.
    ///
    /// The document nests per-strategy metrics under
    /// `strategy.<StrategyName>`; the first strategy entry is used.
    #[must_use]
    pub fn from_raw(raw: &Value) -> Self {
        let Some(strategy) = raw
            .get("strategy")
            .and_then(Value::as_object)
            .and_then(|strategies| strategies.values().next())
        else {
            return Self::default();
        };

        let float = |key: &str| strategy.get(key).and_then(Value::as_f64);
        let count = |key: &str| strategy.get(key).and_then(Value::as_u64);

        Self {
            trades_total: count("total_trades"),
            wins: count("wins"),
            losses: count("losses"),
            draws: count("draws"),
            win_rate: float("winrate"),
            profit_factor: float("profit_factor"),
            profit_total: float("profit_total"),
            profit_total_abs: float("profit_total_abs"),
            max_drawdown: float("max_drawdown_account").or_else(|| float("max_drawdown")),
            sharpe: float("sharpe"),
            sortino: float("sortino"),
            calmar: float("calmar"),
            expectancy: float("expectancy"),
            best_trade: float("backtest_best_day_abs").or_else(|| float("best_pair_profit_abs")),
            worst_trade: float("backtest_worst_day_abs").or_else(|| float("worst_pair_profit_abs")),
            final_balance: float("final_balance"),
        }
    }
}

/// Terminal outcome of a backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub id: WorkloadId,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Wall-clock duration, completed minus started, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
    #[serde(default)]
    pub metrics: BacktestMetrics,
    /// The raw structured result document, or an object carrying
    /// [`EXTRACTION_ERROR_KEY`] when extraction failed.
    pub raw: Value,
    /// Captured workload logs.
    pub logs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BacktestResult {
    /// Assemble a result from a successfully extracted raw document.
    #[must_use]
    pub fn from_raw(
        id: WorkloadId,
        state: JobState,
        exit_code: Option<i64>,
        raw: Value,
        logs: String,
        started: Option<DateTime<Utc>>,
        finished: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            state,
            exit_code,
            duration_secs: duration_secs(started, finished),
            metrics: BacktestMetrics::from_raw(&raw),
            raw,
            logs,
            error: None,
        }
    }

    /// Assemble a result when the structured document could not be read.
    ///
    /// The logs survive and the failure reason lands under
    /// [`EXTRACTION_ERROR_KEY`]; this is not a top-level operation failure.
    #[must_use]
    pub fn extraction_failed(
        id: WorkloadId,
        state: JobState,
        exit_code: Option<i64>,
        reason: impl Into<String>,
        logs: String,
        started: Option<DateTime<Utc>>,
        finished: Option<DateTime<Utc>>,
    ) -> Self {
        let reason = reason.into();
        Self {
            id,
            state,
            exit_code,
            duration_secs: duration_secs(started, finished),
            metrics: BacktestMetrics::default(),
            raw: json!({ EXTRACTION_ERROR_KEY: reason }),
            logs,
            error: Some(reason),
        }
    }
}

/// Terminal outcome of a hyperopt run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperoptResult {
    pub id: WorkloadId,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
    pub epochs: Option<u32>,
    pub best_epoch: Option<u32>,
    /// Loss value of the best epoch; lower is better for every loss
    /// function the workload runtime ships.
    pub best_objective: Option<f64>,
    /// Parameter assignment of the best epoch.
    #[serde(default)]
    pub best_params: HashMap<String, Value>,
    /// Metrics of the best epoch as reported by the optimizer.
    #[serde(default)]
    pub best_metrics: HashMap<String, Value>,
    pub raw: Value,
    pub logs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HyperoptResult {
    /// Assemble a result from the optimizer's epoch records.
    ///
    /// `records` are the JSON lines of the optimizer output file, one per
    /// epoch. The best epoch is the last record flagged `is_best`, falling
    /// back to the lowest loss.
    #[must_use]
    pub fn from_epoch_records(
        id: WorkloadId,
        state: JobState,
        exit_code: Option<i64>,
        records: &[Value],
        logs: String,
        started: Option<DateTime<Utc>>,
        finished: Option<DateTime<Utc>>,
    ) -> Self {
        let best = records
            .iter()
            .rev()
            .find(|rec| rec.get("is_best").and_then(Value::as_bool).unwrap_or(false))
            .or_else(|| {
                records.iter().min_by(|a, b| {
                    let loss_a = a.get("loss").and_then(Value::as_f64).unwrap_or(f64::INFINITY);
                    let loss_b = b.get("loss").and_then(Value::as_f64).unwrap_or(f64::INFINITY);
                    loss_a.total_cmp(&loss_b)
                })
            });

        let as_map = |value: Option<&Value>| -> HashMap<String, Value> {
            value
                .and_then(Value::as_object)
                .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default()
        };

        Self {
            id,
            state,
            exit_code,
            duration_secs: duration_secs(started, finished),
            epochs: records
                .last()
                .and_then(|rec| rec.get("total_epochs"))
                .and_then(Value::as_u64)
                .map(|n| n as u32)
                .or(Some(records.len() as u32)),
            best_epoch: best
                .and_then(|rec| rec.get("current_epoch"))
                .and_then(Value::as_u64)
                .map(|n| n as u32),
            best_objective: best.and_then(|rec| rec.get("loss")).and_then(Value::as_f64),
            best_params: as_map(best.and_then(|rec| rec.get("params_dict"))),
            best_metrics: as_map(best.and_then(|rec| rec.get("results_metrics"))),
            raw: Value::Array(records.to_vec()),
            logs,
            error: None,
        }
    }

    /// Assemble a result when the optimizer output could not be read.
    #[must_use]
    pub fn extraction_failed(
        id: WorkloadId,
        state: JobState,
        exit_code: Option<i64>,
        reason: impl Into<String>,
        logs: String,
    ) -> Self {
        let reason = reason.into();
        Self {
            id,
            state,
            exit_code,
            duration_secs: None,
            epochs: None,
            best_epoch: None,
            best_objective: None,
            best_params: HashMap::new(),
            best_metrics: HashMap::new(),
            raw: json!({ EXTRACTION_ERROR_KEY: reason }),
            logs,
            error: Some(reason),
        }
    }
}

fn duration_secs(started: Option<DateTime<Utc>>, finished: Option<DateTime<Utc>>) -> Option<i64> {
    match (started, finished) {
        (Some(started), Some(finished)) => Some((finished - started).num_seconds()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw_doc() -> Value {
        json!({
            "strategy": {
                "SampleStrategy": {
                    "total_trades": 42,
                    "wins": 28,
                    "losses": 12,
                    "draws": 2,
                    "winrate": 0.6667,
                    "profit_factor": 1.8,
                    "profit_total": 0.153,
                    "profit_total_abs": 153.2,
                    "max_drawdown_account": 0.09,
                    "sharpe": 1.42,
                    "sortino": 2.11,
                    "calmar": 3.5,
                    "expectancy": 0.21,
                    "final_balance": 1153.2
                }
            },
            "strategy_comparison": []
        })
    }

    #[test]
    fn metrics_extracted_from_strategy_subtree() {
        let metrics = BacktestMetrics::from_raw(&raw_doc());
        assert_eq!(metrics.trades_total, Some(42));
        assert_eq!(metrics.wins, Some(28));
        assert_eq!(metrics.win_rate, Some(0.6667));
        assert_eq!(metrics.max_drawdown, Some(0.09));
        assert_eq!(metrics.sharpe, Some(1.42));
        assert_eq!(metrics.final_balance, Some(1153.2));
    }

    #[test]
    fn metrics_tolerate_unknown_schema() {
        assert_eq!(BacktestMetrics::from_raw(&json!({"weird": true})), BacktestMetrics::default());
    }

    #[test]
    fn duration_is_completed_minus_started() {
        let started = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let finished = Utc.with_ymd_and_hms(2024, 3, 1, 10, 7, 30).unwrap();
        let result = BacktestResult::from_raw(
            WorkloadId::random(),
            JobState::Completed,
            Some(0),
            raw_doc(),
            "log line\n".into(),
            Some(started),
            Some(finished),
        );
        assert_eq!(result.duration_secs, Some(450));
        assert!(result.error.is_none());
    }

    #[test]
    fn extraction_failure_keeps_logs_and_flags_raw_map() {
        let result = BacktestResult::extraction_failed(
            WorkloadId::random(),
            JobState::Completed,
            Some(0),
            "pointer file .last_result.json missing",
            "the logs\n".into(),
            None,
            None,
        );
        assert_eq!(result.logs, "the logs\n");
        assert_eq!(
            result.raw[EXTRACTION_ERROR_KEY],
            "pointer file .last_result.json missing"
        );
        assert!(result.error.is_some());
    }

    #[test]
    fn hyperopt_best_epoch_prefers_is_best_flag() {
        let records = vec![
            json!({"current_epoch": 1, "total_epochs": 3, "loss": -1.0, "is_best": true,
                   "params_dict": {"buy_rsi": 28}, "results_metrics": {"total_trades": 10}}),
            json!({"current_epoch": 2, "total_epochs": 3, "loss": -0.5, "is_best": false}),
            json!({"current_epoch": 3, "total_epochs": 3, "loss": -2.2, "is_best": true,
                   "params_dict": {"buy_rsi": 31}, "results_metrics": {"total_trades": 14}}),
        ];
        let result = HyperoptResult::from_epoch_records(
            WorkloadId::random(),
            JobState::Completed,
            Some(0),
            &records,
            String::new(),
            None,
            None,
        );
        assert_eq!(result.epochs, Some(3));
        assert_eq!(result.best_epoch, Some(3));
        assert_eq!(result.best_objective, Some(-2.2));
        assert_eq!(result.best_params["buy_rsi"], 31);
        assert_eq!(result.best_metrics["total_trades"], 14);
    }

    #[test]
    fn hyperopt_falls_back_to_lowest_loss() {
        let records = vec![
            json!({"current_epoch": 1, "loss": 0.8}),
            json!({"current_epoch": 2, "loss": 0.3}),
            json!({"current_epoch": 3, "loss": 0.9}),
        ];
        let result = HyperoptResult::from_epoch_records(
            WorkloadId::random(),
            JobState::Completed,
            None,
            &records,
            String::new(),
            None,
            None,
        );
        assert_eq!(result.best_epoch, Some(2));
        assert_eq!(result.best_objective, Some(0.3));
    }
}
