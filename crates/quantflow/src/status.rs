// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Observed workload state and the legal state machines
//!
//! The substrate's view of a workload is authoritative; the orchestrator's
//! is advisory and reconciled from observations. [`WorkloadState`] carries
//! the legal transition table for long-running bots,
//! [`JobState`] the simpler one for one-shot jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workload::{SubstrateHandle, WorkloadId};

/// State of a long-running workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadState {
    /// Created, start issued, first healthy observation still pending.
    Creating,
    Running,
    /// Running but the declared health check is failing.
    Unhealthy,
    Stopped,
    /// One-shot mapping only; bots never report this.
    Completed,
    /// One-shot mapping only; bots never report this.
    Failed,
    /// Unrecoverable substrate fault (dead, OOM-killed).
    Error,
    /// Removed from the substrate. Reported by the lifecycle engine, never
    /// by a driver.
    Deleted,
}

impl WorkloadState {
    /// Whether the bot state machine permits `self -> next`.
    ///
    /// Self-transitions are always legal (reconciling an unchanged
    /// observation). `Creating -> Stopped` covers the start-failure path,
    /// which leaves the workload stopped with an error message.
    #[must_use]
    pub fn can_transition_to(self, next: WorkloadState) -> bool {
        use WorkloadState::{Creating, Deleted, Error, Running, Stopped, Unhealthy};
        if self == next {
            return true;
        }
        // Any state may be deleted, and any state may fault.
        if matches!(next, Deleted | Error) {
            return true;
        }
        matches!(
            (self, next),
            (Creating, Running)
                | (Creating, Stopped)
                | (Running, Unhealthy)
                | (Unhealthy, Running)
                | (Running, Stopped)
                | (Unhealthy, Stopped)
                | (Stopped, Creating)
        )
    }

    /// Whether a workload in this state accepts no further lifecycle
    /// commands except delete.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkloadState::Completed | WorkloadState::Failed | WorkloadState::Deleted)
    }
}

impl std::fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkloadState::Creating => "creating",
            WorkloadState::Running => "running",
            WorkloadState::Unhealthy => "unhealthy",
            WorkloadState::Stopped => "stopped",
            WorkloadState::Completed => "completed",
            WorkloadState::Failed => "failed",
            WorkloadState::Error => "error",
            WorkloadState::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Point-in-time resource usage of a workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage as a percentage of one core (may exceed 100 on
    /// multi-core workloads). Non-negative and finite.
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
}

/// Observed status of a long-running workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub id: WorkloadId,
    pub state: WorkloadState,
    /// Substrate object handle, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<SubstrateHandle>,
    /// Running and (no declared health check or last probe healthy).
    pub healthy: bool,
    /// When this observation was taken.
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub usage: ResourceUsage,
    /// First non-empty address across attached networks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Host-side port the workload API is published on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl WorkloadStatus {
    /// Minimal status for a workload with no substrate object.
    #[must_use]
    pub fn absent(id: WorkloadId) -> Self {
        Self {
            id,
            state: WorkloadState::Stopped,
            handle: None,
            healthy: false,
            last_seen: Utc::now(),
            usage: ResourceUsage::default(),
            ip_address: None,
            host_port: None,
            error: None,
            created_at: None,
            started_at: None,
            stopped_at: None,
        }
    }
}

/// State of a one-shot job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    /// Whether the one-shot machine permits `self -> next`.
    /// Terminal states persist until explicit delete.
    #[must_use]
    pub fn can_transition_to(self, next: JobState) -> bool {
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Failed)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
        )
    }

    /// Whether the job has finished, successfully or not.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Hyperopt epoch progress, populated while the job runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochProgress {
    pub current_epoch: u32,
    pub total_epochs: u32,
    /// Objective value of the best epoch seen so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_objective: Option<f64>,
}

/// Observed status of a one-shot job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: WorkloadId,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<SubstrateHandle>,
    #[serde(default)]
    pub usage: ResourceUsage,
    /// Coarse completion estimate, 0 to 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<f64>,
    /// Epoch progress; hyperopt jobs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epochs: Option<EpochProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_BOT_STATES: [WorkloadState; 8] = [
        WorkloadState::Creating,
        WorkloadState::Running,
        WorkloadState::Unhealthy,
        WorkloadState::Stopped,
        WorkloadState::Completed,
        WorkloadState::Failed,
        WorkloadState::Error,
        WorkloadState::Deleted,
    ];

    #[test]
    fn bot_machine_follows_the_table() {
        use WorkloadState::{Creating, Running, Stopped, Unhealthy};

        assert!(Creating.can_transition_to(Running));
        assert!(Creating.can_transition_to(Stopped)); // start failure
        assert!(Running.can_transition_to(Unhealthy));
        assert!(Unhealthy.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Unhealthy.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Creating));

        assert!(!Stopped.can_transition_to(Running)); // must go through creating
        assert!(!Running.can_transition_to(Creating));
        assert!(!Stopped.can_transition_to(Unhealthy));
    }

    #[test]
    fn any_state_may_fault_or_be_deleted() {
        for state in ALL_BOT_STATES {
            assert!(state.can_transition_to(WorkloadState::Error));
            assert!(state.can_transition_to(WorkloadState::Deleted));
            assert!(state.can_transition_to(state), "self-transition from {state}");
        }
    }

    #[test]
    fn job_machine_is_linear() {
        use JobState::{Completed, Failed, Queued, Running};

        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Queued.can_transition_to(Failed));

        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn state_names_are_stable() {
        // These strings are part of the persisted status schema.
        assert_eq!(
            serde_json::to_value(WorkloadState::Unhealthy).unwrap(),
            serde_json::json!("unhealthy")
        );
        assert_eq!(serde_json::to_value(JobState::Queued).unwrap(), serde_json::json!("queued"));
        assert_eq!(WorkloadState::Creating.to_string(), "creating");
    }
}
