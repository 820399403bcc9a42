// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! On-substrate file layout and workload command lines
//!
//! Both drivers materialize the same layout under the workload runtime's
//! user-data directory; only the transport differs (bind mount, volume
//! helper, or cluster config objects). The command builders live here so
//! the `--config` overlay order is enforced in exactly one place.

use crate::jobs::HyperoptSpec;
use crate::workload::{BotSpec, ConfigLayerKind, WorkloadId};

/// User-data directory inside the workload image.
pub const USER_DATA_DIR: &str = "/freqtrade/user_data";

/// Directory holding per-run backtest result archives, relative to the
/// user-data directory.
pub const BACKTEST_RESULTS_DIR: &str = "backtest_results";

/// Directory holding optimizer epoch records, relative to the user-data
/// directory.
pub const HYPEROPT_RESULTS_DIR: &str = "hyperopt_results";

/// Directory holding shared historical data, relative to the user-data
/// directory.
pub const DATA_DIR: &str = "data";

/// Pointer file naming the archive of the most recent run.
pub const LAST_RESULT_POINTER: &str = ".last_result.json";

/// Per-workload directory of a bot.
#[must_use]
pub fn bot_dir(id: &WorkloadId) -> String {
    format!("{USER_DATA_DIR}/{id}")
}

/// Path of one config layer of a bot.
#[must_use]
pub fn bot_config_path(id: &WorkloadId, layer: ConfigLayerKind) -> String {
    format!("{}/{}", bot_dir(id), layer.file_name())
}

/// Path of the materialized strategy module of a bot.
#[must_use]
pub fn bot_strategy_path(id: &WorkloadId, file_name: &str) -> String {
    format!("{}/strategies/{file_name}", bot_dir(id))
}

/// Path of the single merged config of a one-shot job.
#[must_use]
pub fn job_config_path() -> String {
    format!("{USER_DATA_DIR}/config.json")
}

/// Path of the materialized strategy module of a one-shot job.
#[must_use]
pub fn job_strategy_path(file_name: &str) -> String {
    format!("{USER_DATA_DIR}/strategies/{file_name}")
}

/// Absolute backtest-results directory.
#[must_use]
pub fn backtest_results_dir() -> String {
    format!("{USER_DATA_DIR}/{BACKTEST_RESULTS_DIR}")
}

/// Absolute hyperopt-results directory.
#[must_use]
pub fn hyperopt_results_dir() -> String {
    format!("{USER_DATA_DIR}/{HYPEROPT_RESULTS_DIR}")
}

/// Absolute shared-data directory.
#[must_use]
pub fn data_dir() -> String {
    format!("{USER_DATA_DIR}/{DATA_DIR}")
}

/// Command line of a bot workload.
///
/// The `--config` arguments come in the fixed order exchange → strategy →
/// bot → secure. The workload runtime merges left to right, so the
/// system-forced secure layer being last is what makes it override user
/// input; re-ordering here is a security regression.
#[must_use]
pub fn trade_command(spec: &BotSpec) -> Vec<String> {
    let mut cmd = vec!["trade".to_string()];
    for layer in ConfigLayerKind::ORDER {
        cmd.push("--config".to_string());
        cmd.push(bot_config_path(&spec.id, layer));
    }
    cmd.push("--strategy".to_string());
    cmd.push(spec.strategy.clone());
    cmd.push("--userdir".to_string());
    cmd.push(bot_dir(&spec.id));
    cmd
}

/// Command line of a backtest job.
#[must_use]
pub fn backtesting_command(strategy: &str) -> Vec<String> {
    vec![
        "backtesting".to_string(),
        "--config".to_string(),
        job_config_path(),
        "--strategy".to_string(),
        strategy.to_string(),
        "--userdir".to_string(),
        USER_DATA_DIR.to_string(),
    ]
}

/// Command line of a hyperopt job.
#[must_use]
pub fn hyperopt_command(spec: &HyperoptSpec) -> Vec<String> {
    let mut cmd = vec![
        "hyperopt".to_string(),
        "--config".to_string(),
        job_config_path(),
        "--strategy".to_string(),
        spec.backtest.strategy.clone(),
        "--userdir".to_string(),
        USER_DATA_DIR.to_string(),
        "--epochs".to_string(),
        spec.epochs.to_string(),
        "--spaces".to_string(),
    ];
    cmd.extend(spec.spaces.iter().cloned());
    cmd.push("--hyperopt-loss".to_string());
    cmd.push(spec.loss.clone());
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::ConfigLayerKind;

    #[test]
    fn bot_layout_matches_contract() {
        let id: WorkloadId = "6e0fb9a2-44f5-4b5a-9c6e-0a4f6f8f2b11".parse().unwrap();
        assert_eq!(
            bot_config_path(&id, ConfigLayerKind::Exchange),
            format!("/freqtrade/user_data/{id}/config.exchange.json")
        );
        assert_eq!(
            bot_strategy_path(&id, "MyStrat.py"),
            format!("/freqtrade/user_data/{id}/strategies/MyStrat.py")
        );
    }

    #[test]
    fn trade_command_config_order_is_fixed() {
        let spec = crate::workload::tests::sample_spec();
        let cmd = trade_command(&spec);

        let config_paths: Vec<&String> = cmd
            .iter()
            .zip(cmd.iter().skip(1))
            .filter(|(flag, _)| *flag == "--config")
            .map(|(_, path)| path)
            .collect();
        assert_eq!(config_paths.len(), 4);
        assert!(config_paths[0].ends_with("config.exchange.json"));
        assert!(config_paths[1].ends_with("config.strategy.json"));
        assert!(config_paths[2].ends_with("config.bot.json"));
        // Secure must be the last --config argument, without exception.
        assert!(config_paths[3].ends_with("config.secure.json"));

        assert_eq!(cmd[0], "trade");
        let strategy_pos = cmd.iter().position(|a| a == "--strategy").unwrap();
        let last_config_pos = cmd.iter().rposition(|a| a == "--config").unwrap();
        assert!(strategy_pos > last_config_pos);
    }

    #[test]
    fn hyperopt_command_carries_spaces_and_loss() {
        let spec = HyperoptSpec {
            backtest: crate::jobs::tests::sample_backtest(),
            epochs: 250,
            spaces: vec!["buy".into(), "roi".into()],
            loss: "SortinoHyperOptLoss".into(),
        };
        let cmd = hyperopt_command(&spec);
        assert_eq!(cmd[0], "hyperopt");
        assert!(cmd.windows(2).any(|w| w[0] == "--epochs" && w[1] == "250"));
        let spaces_pos = cmd.iter().position(|a| a == "--spaces").unwrap();
        assert_eq!(&cmd[spaces_pos + 1..spaces_pos + 3], ["buy", "roi"]);
        assert!(cmd.windows(2).any(|w| w[0] == "--hyperopt-loss" && w[1] == "SortinoHyperOptLoss"));
    }
}
