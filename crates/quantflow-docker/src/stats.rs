// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! State mapping and resource-usage extraction
//!
//! The daemon reports cgroup counters whose shape differs between cgroup
//! v1 and v2: v1 carries a per-CPU usage vector whose length is the CPU
//! count, v2 leaves the vector empty and reports an online-CPU count
//! instead. The CPU-percent formula handles both with a fallback to 1.

use bollard::container::Stats;
use bollard::models::{ContainerState, ContainerStateStatusEnum, HealthStatusEnum};

use quantflow::{ResourceUsage, WorkloadState};

/// CPU usage percentage from daemon stats deltas.
///
/// `(cpu_delta / system_delta) × num_cpus × 100`, where the CPU count is
/// the per-CPU vector length (cgroup v1), else the online-CPU count
/// (cgroup v2), else 1. The result is non-negative and finite.
#[must_use]
pub fn cpu_percent(
    cpu_delta: u64,
    system_delta: u64,
    percpu_len: usize,
    online_cpus: Option<u64>,
) -> f64 {
    if system_delta == 0 {
        return 0.0;
    }
    let num_cpus = if percpu_len > 0 {
        percpu_len as u64
    } else {
        online_cpus.filter(|n| *n > 0).unwrap_or(1)
    };
    let percent = (cpu_delta as f64 / system_delta as f64) * num_cpus as f64 * 100.0;
    if percent.is_finite() {
        percent.max(0.0)
    } else {
        0.0
    }
}

/// Extract a usage snapshot from one stats sample.
#[must_use]
pub fn usage_from_stats(stats: &Stats) -> ResourceUsage {
    let cpu_delta = stats
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
    let system_delta = stats
        .cpu_stats
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
    let percpu_len =
        stats.cpu_stats.cpu_usage.percpu_usage.as_ref().map_or(0, Vec::len);

    let (net_rx, net_tx) = stats
        .networks
        .as_ref()
        .map(|nets| {
            nets.values().fold((0u64, 0u64), |(rx, tx), net| {
                (rx + net.rx_bytes, tx + net.tx_bytes)
            })
        })
        .unwrap_or((0, 0));

    let (blk_read, blk_write) = stats
        .blkio_stats
        .io_service_bytes_recursive
        .as_ref()
        .map(|entries| {
            entries.iter().fold((0u64, 0u64), |(read, write), entry| {
                match entry.op.as_str() {
                    "read" | "Read" => (read + entry.value, write),
                    "write" | "Write" => (read, write + entry.value),
                    _ => (read, write),
                }
            })
        })
        .unwrap_or((0, 0));

    ResourceUsage {
        cpu_percent: cpu_percent(
            cpu_delta,
            system_delta,
            percpu_len,
            stats.cpu_stats.online_cpus,
        ),
        memory_bytes: stats.memory_stats.usage.unwrap_or(0),
        net_rx_bytes: net_rx,
        net_tx_bytes: net_tx,
        block_read_bytes: blk_read,
        block_write_bytes: blk_write,
    }
}

/// Map the daemon's container state onto the workload state enum.
///
/// The mapping is total: every daemon state lands in exactly one workload
/// state.
#[must_use]
pub fn map_container_state(state: &ContainerState) -> WorkloadState {
    let health = state.health.as_ref().and_then(|h| h.status);
    let oom = state.oom_killed.unwrap_or(false);

    match state.status {
        Some(ContainerStateStatusEnum::RUNNING) => match health {
            Some(HealthStatusEnum::UNHEALTHY) => WorkloadState::Unhealthy,
            _ => WorkloadState::Running,
        },
        Some(ContainerStateStatusEnum::RESTARTING) => WorkloadState::Creating,
        Some(ContainerStateStatusEnum::PAUSED) => WorkloadState::Stopped,
        Some(ContainerStateStatusEnum::DEAD) => WorkloadState::Error,
        _ if oom => WorkloadState::Error,
        _ => WorkloadState::Stopped,
    }
}

/// Health flag: running and (no declared health check or last probe
/// healthy).
#[must_use]
pub fn is_healthy(state: &ContainerState) -> bool {
    let running = matches!(state.status, Some(ContainerStateStatusEnum::RUNNING));
    let health_ok = match state.health.as_ref().and_then(|h| h.status) {
        None | Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) => true,
        Some(HealthStatusEnum::HEALTHY) => true,
        Some(HealthStatusEnum::STARTING) | Some(HealthStatusEnum::UNHEALTHY) => false,
    };
    running && health_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::Health;

    #[test]
    fn cpu_percent_cgroup_v2_uses_online_cpus() {
        // Scenario: cpu_delta=100ms of 1s system time across 4 CPUs.
        let percent = cpu_percent(100_000_000, 1_000_000_000, 0, Some(4));
        assert!((percent - 40.0).abs() < 0.001);
    }

    #[test]
    fn cpu_percent_cgroup_v1_uses_percpu_vector_length() {
        let percent = cpu_percent(100_000_000, 1_000_000_000, 2, Some(8));
        assert!((percent - 20.0).abs() < 0.001);
    }

    #[test]
    fn cpu_percent_falls_back_to_one_cpu() {
        let percent = cpu_percent(500_000_000, 1_000_000_000, 0, None);
        assert!((percent - 50.0).abs() < 0.001);
        let percent = cpu_percent(500_000_000, 1_000_000_000, 0, Some(0));
        assert!((percent - 50.0).abs() < 0.001);
    }

    #[test]
    fn cpu_percent_is_non_negative_and_finite() {
        assert_eq!(cpu_percent(1, 0, 0, None), 0.0);
        assert_eq!(cpu_percent(0, 0, 0, Some(0)), 0.0);
        let percent = cpu_percent(u64::MAX, 1, 0, Some(64));
        assert!(percent.is_finite() && percent >= 0.0);
    }

    fn state(
        status: ContainerStateStatusEnum,
        health: Option<HealthStatusEnum>,
        oom: bool,
    ) -> ContainerState {
        ContainerState {
            status: Some(status),
            health: health.map(|h| Health { status: Some(h), ..Default::default() }),
            oom_killed: Some(oom),
            ..Default::default()
        }
    }

    #[test]
    fn state_mapping_is_total() {
        use ContainerStateStatusEnum as S;

        let cases = [
            (state(S::RUNNING, Some(HealthStatusEnum::HEALTHY), false), WorkloadState::Running),
            (state(S::RUNNING, None, false), WorkloadState::Running),
            (state(S::RUNNING, Some(HealthStatusEnum::UNHEALTHY), false), WorkloadState::Unhealthy),
            (state(S::RESTARTING, None, false), WorkloadState::Creating),
            (state(S::PAUSED, None, false), WorkloadState::Stopped),
            (state(S::DEAD, None, false), WorkloadState::Error),
            (state(S::EXITED, None, true), WorkloadState::Error),
            (state(S::EXITED, None, false), WorkloadState::Stopped),
            (state(S::CREATED, None, false), WorkloadState::Stopped),
            (state(S::REMOVING, None, false), WorkloadState::Stopped),
            (state(S::EMPTY, None, false), WorkloadState::Stopped),
        ];
        for (input, expected) in cases {
            assert_eq!(map_container_state(&input), expected, "{:?}", input.status);
        }
    }

    #[test]
    fn health_requires_running() {
        use ContainerStateStatusEnum as S;

        assert!(is_healthy(&state(S::RUNNING, None, false)));
        assert!(is_healthy(&state(S::RUNNING, Some(HealthStatusEnum::HEALTHY), false)));
        assert!(!is_healthy(&state(S::RUNNING, Some(HealthStatusEnum::STARTING), false)));
        assert!(!is_healthy(&state(S::RUNNING, Some(HealthStatusEnum::UNHEALTHY), false)));
        assert!(!is_healthy(&state(S::EXITED, None, false)));
    }
}
