// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Daemon connection management and error classification
//!
//! One [`DockerClient`] is shared across every operation of a driver; the
//! underlying SDK client is thread-safe and holds no per-workload state.
//! Mutual TLS material arrives as PEM text inside the runner config and is
//! staged into a short-lived temp directory only for the connect call.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::{ClientVersion, Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use quantflow::error::{Error, ErrorKind, Result};
use quantflow::naming::LABEL_MANAGED;
use quantflow::{DockerRunnerConfig, OpCtx};

/// Connect timeout handed to the SDK, seconds.
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Health probes must answer within this bound.
pub(crate) const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Stop grace period, seconds.
pub(crate) const STOP_GRACE_SECS: i64 = 30;

/// Shared daemon connection of one driver instance.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
    config: DockerRunnerConfig,
}

impl DockerClient {
    /// Connect to the daemon described by the runner config.
    ///
    /// Does not probe the daemon; the factory runs the health check after
    /// construction.
    pub fn connect(config: &DockerRunnerConfig) -> Result<Self> {
        let pinned = match &config.api_version {
            Some(pin) => Some(parse_api_version(pin)?),
            None => None,
        };
        let version = pinned.as_ref().unwrap_or(API_DEFAULT_VERSION);

        let docker = if config.endpoint.starts_with("unix://") {
            Docker::connect_with_unix(&config.endpoint, CONNECT_TIMEOUT_SECS, version)
        } else if config.has_tls() {
            let staged = StagedTls::write(config)?;
            Docker::connect_with_ssl(
                &config.endpoint,
                &staged.key,
                &staged.cert,
                &staged.ca,
                CONNECT_TIMEOUT_SECS,
                version,
            )
        } else {
            Docker::connect_with_http(&config.endpoint, CONNECT_TIMEOUT_SECS, version)
        }
        .map_err(|e| docker_err("connect", e))?;

        debug!(endpoint = %config.endpoint, remote = config.is_remote(), "daemon client ready");
        Ok(Self { docker, config: config.clone() })
    }

    /// The SDK handle.
    #[must_use]
    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    /// The runner config this client was built from.
    #[must_use]
    pub fn config(&self) -> &DockerRunnerConfig {
        &self.config
    }

    /// Whether artifacts must go through substrate volumes instead of bind
    /// mounts.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.config.is_remote()
    }

    /// Ping the daemon within the 2-second health bound.
    pub async fn health_check(&self, ctx: &OpCtx) -> Result<()> {
        let ping = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.docker.ping());
        match ctx.guard("health-check", ping).await? {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(docker_err("health-check", e)),
            Err(_) => Err(Error::new(
                "health-check",
                ErrorKind::Unreachable(format!(
                    "daemon did not answer within {}s",
                    HEALTH_CHECK_TIMEOUT.as_secs()
                )),
            )),
        }
    }

    /// Release the connection. The SDK client drops its pooled connections
    /// when the last clone goes away; this exists so callers can close
    /// deterministically.
    pub async fn close(&self) -> Result<()> {
        debug!(endpoint = %self.config.endpoint, "closing daemon client");
        Ok(())
    }

    /// Resolve a managed container: by deterministic name first, then by
    /// label. Returns the container id.
    pub async fn find_container(
        &self,
        ctx: &OpCtx,
        name: &str,
        label_key: &str,
        label_value: &str,
    ) -> Result<Option<String>> {
        let inspect = ctx
            .guard(
                "find-container",
                self.docker.inspect_container(name, None::<InspectContainerOptions>),
            )
            .await?;
        match inspect {
            Ok(details) => return Ok(details.id),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(docker_err("find-container", e)),
        }

        let mut filters = std::collections::HashMap::new();
        filters.insert("label".to_string(), vec![
            format!("{LABEL_MANAGED}=true"),
            format!("{label_key}={label_value}"),
        ]);
        let options = ListContainersOptions { all: true, filters, ..Default::default() };
        let found = ctx
            .guard("find-container", self.docker.list_containers(Some(options)))
            .await?
            .map_err(|e| docker_err("find-container", e))?;
        if found.len() > 1 {
            warn!(label = %label_value, count = found.len(), "multiple containers carry the same workload label");
        }
        Ok(found.into_iter().next().and_then(|c| c.id))
    }

    /// Host-side scratch directory for bind mounts on a local daemon.
    #[must_use]
    pub fn scratch_dir(&self, key: &str) -> PathBuf {
        std::env::temp_dir().join("quantflow").join(key)
    }
}

struct StagedTls {
    key: PathBuf,
    cert: PathBuf,
    ca: PathBuf,
    // Removed on drop, after the connect call has loaded the material.
    _dir: tempfile::TempDir,
}

impl StagedTls {
    fn write(config: &DockerRunnerConfig) -> Result<Self> {
        let dir = tempfile::tempdir().map_err(|e| Error::new("connect", ErrorKind::Io(e)))?;
        let write = |name: &str, pem: Option<&String>| -> Result<PathBuf> {
            let path = dir.path().join(name);
            let pem = pem.ok_or_else(|| {
                Error::validation("connect", "incomplete TLS material in runner config")
            })?;
            let mut file =
                std::fs::File::create(&path).map_err(|e| Error::new("connect", ErrorKind::Io(e)))?;
            file.write_all(pem.as_bytes())
                .map_err(|e| Error::new("connect", ErrorKind::Io(e)))?;
            Ok(path)
        };
        Ok(Self {
            key: write("key.pem", config.tls_key.as_ref())?,
            cert: write("cert.pem", config.tls_cert.as_ref())?,
            ca: write("ca.pem", config.tls_ca.as_ref())?,
            _dir: dir,
        })
    }
}

fn parse_api_version(pin: &str) -> Result<ClientVersion> {
    let (major, minor) = pin
        .split_once('.')
        .and_then(|(major, minor)| {
            Some((major.parse::<usize>().ok()?, minor.parse::<usize>().ok()?))
        })
        .ok_or_else(|| {
            Error::validation("connect", format!("malformed API-version pin '{pin}'"))
        })?;
    Ok(ClientVersion { major_version: major, minor_version: minor })
}

/// Whether an SDK error is the daemon's 404.
pub(crate) fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

/// Map an SDK failure into the structured error taxonomy.
///
/// Connection-layer failures are retryable; daemon rejections are
/// classified by status code.
pub(crate) fn docker_err(operation: &str, err: bollard::errors::Error) -> Error {
    Error::new(operation, classify(err))
}

fn classify(err: bollard::errors::Error) -> ErrorKind {
    use bollard::errors::Error as B;
    match err {
        B::DockerResponseServerError { status_code, message } => match status_code {
            404 => ErrorKind::NotFound(message),
            409 => ErrorKind::AlreadyExists(message),
            401 | 403 => ErrorKind::Permanent(message),
            429 => ErrorKind::Transient(message),
            500..=599 => ErrorKind::Transient(message),
            _ => ErrorKind::Permanent(message),
        },
        B::IOError { err } => ErrorKind::Unreachable(err.to_string()),
        B::RequestTimeoutError => ErrorKind::Unreachable("daemon request timed out".to_string()),
        other => {
            let text = other.to_string();
            if text.contains("connection") || text.contains("handshake") {
                ErrorKind::Unreachable(text)
            } else {
                ErrorKind::Other(text)
            }
        }
    }
}

/// Parse a daemon timestamp, treating the zero value as absent.
#[must_use]
pub(crate) fn parse_docker_time(value: Option<&String>) -> Option<DateTime<Utc>> {
    let value = value?;
    if value.starts_with("0001-01-01") {
        return None;
    }
    DateTime::parse_from_rfc3339(value).ok().map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_pin_parses() {
        let version = parse_api_version("1.44").unwrap();
        assert_eq!(version.major_version, 1);
        assert_eq!(version.minor_version, 44);
        assert!(parse_api_version("latest").is_err());
    }

    #[test]
    fn status_codes_classify_by_retryability() {
        let server = |code: u16| bollard::errors::Error::DockerResponseServerError {
            status_code: code,
            message: "m".into(),
        };
        assert!(matches!(classify(server(404)), ErrorKind::NotFound(_)));
        assert!(matches!(classify(server(409)), ErrorKind::AlreadyExists(_)));
        assert!(matches!(classify(server(403)), ErrorKind::Permanent(_)));
        assert!(classify(server(429)).is_retryable());
        assert!(classify(server(503)).is_retryable());
        assert!(!classify(server(400)).is_retryable());
    }

    #[test]
    fn zero_timestamps_are_absent() {
        assert_eq!(parse_docker_time(Some(&"0001-01-01T00:00:00Z".to_string())), None);
        let parsed = parse_docker_time(Some(&"2024-03-01T10:00:00.000000000Z".to_string()));
        assert!(parsed.is_some());
        assert_eq!(parse_docker_time(None), None);
    }
}
