// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Deterministic substrate object names and the managed-label schema
//!
//! Every managed object's name derives from the workload identifier, which
//! makes create idempotent under at-least-once delivery and lets delete
//! find objects by name before falling back to handle or label lookup.

use std::collections::HashMap;

use crate::sanitize::label_value;
use crate::workload::WorkloadId;

/// Per-deployment prefix on every object name and label key.
pub const PREFIX: &str = "quantflow";

/// Label marking an object as managed by this orchestrator. Value `"true"`.
pub const LABEL_MANAGED: &str = "quantflow.managed";
/// Label carrying the bot workload identifier.
pub const LABEL_BOT_ID: &str = "quantflow.bot.id";
/// Label carrying the bot display name (sanitized).
pub const LABEL_BOT_NAME: &str = "quantflow.bot.name";
/// Label carrying the one-shot job identifier.
pub const LABEL_JOB_ID: &str = "quantflow.backtest.id";
/// Label discriminating one-shot job families.
pub const LABEL_TASK_TYPE: &str = "quantflow.task.type";

/// One-shot job family, stored in [`LABEL_TASK_TYPE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Backtest,
    Hyperopt,
    DataDownload,
}

impl TaskType {
    /// Label value for this family.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Backtest => "backtest",
            TaskType::Hyperopt => "hyperopt",
            TaskType::DataDownload => "data-download",
        }
    }

    /// Parse a label value back into a family.
    #[must_use]
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "backtest" => Some(TaskType::Backtest),
            "hyperopt" => Some(TaskType::Hyperopt),
            "data-download" => Some(TaskType::DataDownload),
            _ => None,
        }
    }
}

/// Substrate object name for a bot workload.
#[must_use]
pub fn bot_object_name(id: &WorkloadId) -> String {
    format!("{PREFIX}-bot-{id}")
}

/// Substrate object name for a backtest job.
#[must_use]
pub fn backtest_object_name(id: &WorkloadId) -> String {
    format!("{PREFIX}-backtest-{id}")
}

/// Substrate object name for a hyperopt job.
#[must_use]
pub fn hyperopt_object_name(id: &WorkloadId) -> String {
    format!("{PREFIX}-hyperopt-{id}")
}

/// Substrate object name for a data-download task.
#[must_use]
pub fn download_object_name(id: &WorkloadId) -> String {
    format!("{PREFIX}-data-{id}")
}

/// Labels applied to a bot object.
#[must_use]
pub fn bot_labels(id: &WorkloadId, display_name: &str) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_MANAGED.to_string(), "true".to_string()),
        (LABEL_BOT_ID.to_string(), id.to_string()),
        (LABEL_BOT_NAME.to_string(), label_value(display_name)),
    ])
}

/// Labels applied to a one-shot job object.
#[must_use]
pub fn job_labels(id: &WorkloadId, task: TaskType) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_MANAGED.to_string(), "true".to_string()),
        (LABEL_JOB_ID.to_string(), id.to_string()),
        (LABEL_TASK_TYPE.to_string(), task.as_str().to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_are_deterministic() {
        let id: WorkloadId = "6e0fb9a2-44f5-4b5a-9c6e-0a4f6f8f2b11".parse().unwrap();
        assert_eq!(bot_object_name(&id), format!("quantflow-bot-{id}"));
        assert_eq!(backtest_object_name(&id), format!("quantflow-backtest-{id}"));
        assert_eq!(hyperopt_object_name(&id), format!("quantflow-hyperopt-{id}"));
        assert_eq!(bot_object_name(&id), bot_object_name(&id));
    }

    #[test]
    fn every_managed_object_carries_id_and_marker() {
        let id: WorkloadId = "6e0fb9a2-44f5-4b5a-9c6e-0a4f6f8f2b11".parse().unwrap();

        let bot = bot_labels(&id, "RSI scalper #3");
        assert_eq!(bot[LABEL_MANAGED], "true");
        assert_eq!(bot[LABEL_BOT_ID], id.to_string());
        assert_eq!(bot[LABEL_BOT_NAME], "RSI-scalper-3");

        let job = job_labels(&id, TaskType::Hyperopt);
        assert_eq!(job[LABEL_MANAGED], "true");
        assert_eq!(job[LABEL_JOB_ID], id.to_string());
        assert_eq!(job[LABEL_TASK_TYPE], "hyperopt");
    }

    #[test]
    fn task_type_labels_round_trip() {
        for task in [TaskType::Backtest, TaskType::Hyperopt, TaskType::DataDownload] {
            assert_eq!(TaskType::from_label(task.as_str()), Some(task));
        }
        assert_eq!(TaskType::from_label("cron"), None);
    }
}
