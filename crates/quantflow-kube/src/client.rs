// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Cluster connection management and error classification
//!
//! A runner may embed its cluster credential document (kubeconfig YAML,
//! optionally base64-wrapped for transport); otherwise ambient
//! configuration is inferred the way the SDK normally does. All managed
//! objects live in the runner's namespace.

use std::time::Duration;

use base64::Engine;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use quantflow::error::{Error, ErrorKind, Result};
use quantflow::{KubeRunnerConfig, OpCtx};

/// Health probes must answer within this bound.
pub(crate) const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Stop/delete grace period, seconds.
pub(crate) const STOP_GRACE_SECS: u32 = 30;

/// Shared cluster connection of one driver instance.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    config: KubeRunnerConfig,
}

impl KubeClient {
    /// Connect using the runner's embedded credentials, or ambient
    /// configuration when none are embedded.
    pub async fn connect(runner_config: &KubeRunnerConfig) -> Result<Self> {
        let client_config = match &runner_config.kubeconfig {
            Some(document) => {
                let yaml = decode_credential_document(document)?;
                let kubeconfig = Kubeconfig::from_yaml(&yaml).map_err(|e| {
                    Error::validation("connect", format!("malformed cluster credentials: {e}"))
                })?;
                let options = KubeConfigOptions {
                    context: runner_config.context.clone(),
                    ..Default::default()
                };
                Config::from_custom_kubeconfig(kubeconfig, &options).await.map_err(|e| {
                    Error::validation("connect", format!("unusable cluster credentials: {e}"))
                })?
            }
            None => Config::infer().await.map_err(|e| {
                Error::new(
                    "connect",
                    ErrorKind::Unreachable(format!("no ambient cluster configuration: {e}")),
                )
            })?,
        };

        let client = Client::try_from(client_config)
            .map_err(|e| Error::new("connect", kube_error_kind(e)))?;
        debug!(namespace = %runner_config.namespace, "cluster client ready");
        Ok(Self { client, config: runner_config.clone() })
    }

    /// The SDK handle.
    #[must_use]
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// The namespace all managed objects live in.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// The runner config this client was built from.
    #[must_use]
    pub fn config(&self) -> &KubeRunnerConfig {
        &self.config
    }

    /// Probe the API server within the 2-second health bound.
    pub async fn health_check(&self, ctx: &OpCtx) -> Result<()> {
        let probe = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.client.apiserver_version());
        match ctx.guard("health-check", probe).await? {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(kube_err("health-check", e)),
            Err(_) => Err(Error::new(
                "health-check",
                ErrorKind::Unreachable(format!(
                    "API server did not answer within {}s",
                    HEALTH_CHECK_TIMEOUT.as_secs()
                )),
            )),
        }
    }

    /// Release the connection. The SDK's client drops its pools with the
    /// last clone; this exists for deterministic shutdown.
    pub async fn close(&self) -> Result<()> {
        debug!(namespace = %self.config.namespace, "closing cluster client");
        Ok(())
    }
}

/// Credential documents may arrive as raw YAML or base64-wrapped YAML.
fn decode_credential_document(document: &str) -> Result<String> {
    let trimmed = document.trim();
    if trimmed.starts_with("apiVersion") || trimmed.contains("\nclusters:") {
        return Ok(trimmed.to_string());
    }
    match base64::engine::general_purpose::STANDARD.decode(trimmed) {
        Ok(bytes) => String::from_utf8(bytes).map_err(|_| {
            Error::validation("connect", "decoded cluster credentials are not UTF-8")
        }),
        // Not base64 either; let the YAML parser produce the real error.
        Err(_) => Ok(trimmed.to_string()),
    }
}

/// Whether an SDK error is the API server's 404.
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

/// Map an SDK failure into the structured error taxonomy.
pub(crate) fn kube_err(operation: &str, err: kube::Error) -> Error {
    Error::new(operation, kube_error_kind(err))
}

fn kube_error_kind(err: kube::Error) -> ErrorKind {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => ErrorKind::NotFound(response.message),
            409 => ErrorKind::AlreadyExists(response.message),
            401 | 403 => ErrorKind::Permanent(response.message),
            429 => ErrorKind::Transient(response.message),
            500..=599 => ErrorKind::Transient(response.message),
            _ => ErrorKind::Permanent(response.message),
        },
        kube::Error::HyperError(e) => ErrorKind::Unreachable(e.to_string()),
        kube::Error::Service(e) => ErrorKind::Unreachable(e.to_string()),
        other => {
            let text = other.to_string();
            if text.contains("connection") || text.contains("timed out") {
                ErrorKind::Unreachable(text)
            } else {
                ErrorKind::Other(text)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_yaml_documents_pass_through() {
        let yaml = "apiVersion: v1\nclusters: []\n";
        assert_eq!(decode_credential_document(yaml).unwrap(), yaml.trim());
    }

    #[test]
    fn base64_documents_are_unwrapped() {
        let yaml = "apiVersion: v1\nclusters: []\n";
        let encoded = base64::engine::general_purpose::STANDARD.encode(yaml);
        assert_eq!(decode_credential_document(&encoded).unwrap(), yaml);
    }

    #[test]
    fn api_codes_classify_by_retryability() {
        let api = |code: u16| {
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "m".into(),
                reason: "r".into(),
                code,
            })
        };
        assert!(matches!(kube_error_kind(api(404)), ErrorKind::NotFound(_)));
        assert!(matches!(kube_error_kind(api(409)), ErrorKind::AlreadyExists(_)));
        assert!(!kube_error_kind(api(403)).is_retryable());
        assert!(kube_error_kind(api(429)).is_retryable());
        assert!(kube_error_kind(api(503)).is_retryable());
    }
}
