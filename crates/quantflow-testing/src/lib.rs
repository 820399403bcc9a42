// Allow unwrap in testing utilities - test code should panic on errors
#![allow(clippy::unwrap_used)]

//! # QuantFlow Testing Utilities
//!
//! This crate provides testing utilities for QuantFlow, including:
//!
//! - **MockSubstrate**: an in-memory substrate implementing all three
//!   capability interfaces, with explicit substrate-side observation
//!   hooks (`observe_health`, `finish_job`, `advance_download`)
//! - **Spec builders**: ready-made bot and job specs for driver tests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use quantflow_testing::{sample_bot_spec, MockSubstrate};
//! use quantflow::{LifecycleEngine, OpCtx};
//! use std::sync::Arc;
//!
//! let substrate = MockSubstrate::new();
//! let engine = LifecycleEngine::new(Arc::new(substrate.clone()));
//! let spec = sample_bot_spec();
//! engine.create(&OpCtx::new(), &spec).await?;
//! substrate.observe_health(&spec.id, true);
//! ```

mod mock_substrate;

pub use mock_substrate::MockSubstrate;

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use quantflow::jobs::{BacktestSpec, DataDownloadSpec, ExchangeDownload, MarketMode};
use quantflow::workload::{BotSpec, ConfigLayers, ResourceLimits, RunnerId, WorkloadId};

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

/// A fully-populated bot spec for tests.
#[must_use]
pub fn sample_bot_spec() -> BotSpec {
    let config = ConfigLayers {
        exchange: object(json!({"exchange": {"name": "binance", "key": "K", "secret": "S"}})),
        strategy: object(json!({"timeframe": "1h"})),
        bot: object(json!({"stake_amount": 100})),
        secure: Map::new(),
    }
    .with_secure_defaults(8080);

    BotSpec {
        id: WorkloadId::random(),
        name: "test bot".into(),
        image: "fq:stable".into(),
        strategy: "MyStrat".into(),
        strategy_code: "class MyStrat:\n    pass\n".into(),
        config,
        env: HashMap::new(),
        limits: ResourceLimits { memory_bytes: Some(256 * 1024 * 1024), cpus: Some(0.5) },
        network: None,
        api_port: 8080,
    }
}

/// A fully-populated backtest spec for tests.
#[must_use]
pub fn sample_backtest_spec() -> BacktestSpec {
    BacktestSpec {
        id: WorkloadId::random(),
        strategy: "MyStrat".into(),
        strategy_code: "class MyStrat:\n    pass\n".into(),
        strategy_config: object(json!({"timeframe": "1h"})),
        backtest_config: object(json!({"timerange": "20240101-20240301"})),
        image: "fq:stable".into(),
        env: HashMap::new(),
        limits: ResourceLimits::default(),
        data_url: None,
    }
}

/// A fully-populated data-download spec for tests.
#[must_use]
pub fn sample_download_spec() -> DataDownloadSpec {
    DataDownloadSpec {
        id: WorkloadId::random(),
        runner: RunnerId::random(),
        existing_data_url: None,
        upload_url: "https://storage.example/bundle?sig=test".into(),
        image: "fq:stable".into(),
        exchanges: vec![ExchangeDownload {
            exchange: "binance".into(),
            pairs: ".*/USDT".into(),
            timeframes: vec!["5m".into(), "1h".into()],
            days: 30,
            mode: MarketMode::Spot,
        }],
    }
}

/// A raw backtest result document in the workload runtime's shape.
#[must_use]
pub fn sample_raw_backtest_result() -> Value {
    json!({
        "strategy": {
            "MyStrat": {
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

#[cfg(test)]
mod tests {
    use super::*;
    use quantflow::{JobController, OpCtx, WorkloadController};

    #[tokio::test]
    async fn mock_substrate_round_trips_a_bot() {
        let substrate = MockSubstrate::new();
        let ctx = OpCtx::new();
        let spec = sample_bot_spec();

        WorkloadController::create(&substrate, &ctx, &spec).await.unwrap();
        substrate.observe_health(&spec.id, true);
        let status = WorkloadController::status(&substrate, &ctx, &spec.id).await.unwrap();
        assert!(status.healthy);

        WorkloadController::delete(&substrate, &ctx, &spec.id).await.unwrap();
        assert!(!substrate.has_object(&spec.id));
    }

    #[tokio::test]
    async fn mock_substrate_serves_backtest_results() {
        let substrate = MockSubstrate::new();
        let ctx = OpCtx::new();
        let spec = sample_backtest_spec();

        JobController::start_backtest(&substrate, &ctx, &spec).await.unwrap();
        substrate.finish_job(&spec.id, 0, "done\n", Some(sample_raw_backtest_result()));

        let result = substrate.backtest_result(&ctx, &spec.id).await.unwrap();
        assert_eq!(result.metrics.trades_total, Some(42));
    }
}
