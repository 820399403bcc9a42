// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Best-effort resource usage via the cluster metrics endpoint
//!
//! Clusters do not expose per-container counters the way a container
//! daemon does; when the runner configures a metrics endpoint, pod usage
//! is fetched from the metrics API and mapped onto the same
//! [`ResourceUsage`] shape (network and block counters stay zero).
//! Without an endpoint, usage is all zeros — status still works.

use serde::Deserialize;
use tracing::debug;

use quantflow::ResourceUsage;

#[derive(Debug, Deserialize)]
struct PodMetrics {
    containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Deserialize)]
struct ContainerMetrics {
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    cpu: String,
    memory: String,
}

/// Fetch one pod's usage. Any failure degrades to `None`; metrics are
/// advisory.
pub(crate) async fn pod_usage(
    http: &reqwest::Client,
    endpoint: &str,
    namespace: &str,
    pod: &str,
) -> Option<ResourceUsage> {
    let url = format!(
        "{}/apis/metrics.k8s.io/v1beta1/namespaces/{namespace}/pods/{pod}",
        endpoint.trim_end_matches('/')
    );
    let metrics: PodMetrics = match http.get(&url).send().await {
        Ok(response) => response.json().await.ok()?,
        Err(e) => {
            debug!(pod, error = %e, "metrics endpoint unreachable");
            return None;
        }
    };

    let (cores, memory) = metrics.containers.iter().fold((0.0_f64, 0_u64), |(c, m), container| {
        (
            c + parse_cpu_quantity(&container.usage.cpu).unwrap_or(0.0),
            m + parse_memory_quantity(&container.usage.memory).unwrap_or(0),
        )
    });

    Some(ResourceUsage {
        cpu_percent: (cores * 100.0).max(0.0),
        memory_bytes: memory,
        ..Default::default()
    })
}

/// Parse a CPU quantity into cores: `250m`, `1`, `12345678n`, `1500u`.
pub(crate) fn parse_cpu_quantity(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    if let Some(value) = quantity.strip_suffix('n') {
        return Some(value.parse::<f64>().ok()? / 1e9);
    }
    if let Some(value) = quantity.strip_suffix('u') {
        return Some(value.parse::<f64>().ok()? / 1e6);
    }
    if let Some(value) = quantity.strip_suffix('m') {
        return Some(value.parse::<f64>().ok()? / 1e3);
    }
    quantity.parse::<f64>().ok()
}

/// Parse a memory quantity into bytes: `128974848`, `123Mi`, `1Gi`, `2G`.
pub(crate) fn parse_memory_quantity(quantity: &str) -> Option<u64> {
    let quantity = quantity.trim();
    const UNITS: [(&str, u64); 10] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1u64 << 40),
        ("Pi", 1u64 << 50),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("P", 1_000_000_000_000_000),
    ];
    for (suffix, multiplier) in UNITS {
        if let Some(value) = quantity.strip_suffix(suffix) {
            return Some((value.parse::<f64>().ok()? * multiplier as f64) as u64);
        }
    }
    quantity.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_quantities_parse_to_cores() {
        assert_eq!(parse_cpu_quantity("250m"), Some(0.25));
        assert_eq!(parse_cpu_quantity("2"), Some(2.0));
        assert_eq!(parse_cpu_quantity("500000000n"), Some(0.5));
        assert_eq!(parse_cpu_quantity("garbage"), None);
    }

    #[test]
    fn memory_quantities_parse_to_bytes() {
        assert_eq!(parse_memory_quantity("128974848"), Some(128_974_848));
        assert_eq!(parse_memory_quantity("1Ki"), Some(1024));
        assert_eq!(parse_memory_quantity("123Mi"), Some(123 * 1024 * 1024));
        assert_eq!(parse_memory_quantity("2G"), Some(2_000_000_000));
        assert_eq!(parse_memory_quantity("x"), None);
    }
}
