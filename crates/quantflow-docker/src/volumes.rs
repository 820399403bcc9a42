// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Volume helper: substrate-resident filesystem access
//!
//! Against a remote daemon the operator's filesystem is invisible, so
//! bytes move through disposable helper containers that mount the target
//! volume: writes go in single-quote-escaped on the command line, reads
//! come back through the log channel. Helper output is collected from the
//! demultiplexed stdout frames only — stderr noise must never corrupt
//! recovered file bytes.
//!
//! There is no helper pool; each call spawns and removes its own
//! container.

use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::volume::CreateVolumeOptions;
use futures::StreamExt;
use tracing::{debug, warn};

use quantflow::error::{Error, ErrorKind, Result};
use quantflow::naming::LABEL_MANAGED;
use quantflow::sanitize::shell_escape;
use quantflow::OpCtx;

use crate::client::{docker_err, is_not_found, DockerClient};

/// Image helper containers run. Provides `sh`, `cat`, `rm` and `unzip`.
pub const HELPER_IMAGE: &str = "busybox:stable";

/// Where the target volume is mounted inside helper containers.
const MOUNT_POINT: &str = "/work";

/// Disposable-helper access to daemon volumes.
#[derive(Clone)]
pub struct VolumeHelper {
    client: DockerClient,
    image: String,
}

impl VolumeHelper {
    /// Helper bound to one daemon connection.
    #[must_use]
    pub fn new(client: DockerClient) -> Self {
        Self { client, image: HELPER_IMAGE.to_string() }
    }

    /// Override the helper image (tests, air-gapped registries).
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Pull the helper image if the daemon does not have it yet.
    pub async fn ensure_helper_image(&self, ctx: &OpCtx) -> Result<()> {
        let options =
            CreateImageOptions { from_image: self.image.clone(), ..Default::default() };
        let mut pull = self.client.docker().create_image(Some(options), None, None);
        while let Some(progress) = ctx.guard("ensure-helper-image", pull.next()).await? {
            progress.map_err(|e| docker_err("ensure-helper-image", e))?;
        }
        Ok(())
    }

    /// Create a named volume; an existing volume of that name is fine.
    pub async fn ensure_volume(&self, ctx: &OpCtx, name: &str) -> Result<()> {
        let options = CreateVolumeOptions { name: name.to_string(), ..Default::default() };
        ctx.guard("ensure-volume", self.client.docker().create_volume(options))
            .await?
            .map(|_| ())
            .or_else(|e| match e {
                bollard::errors::Error::DockerResponseServerError { status_code: 409, .. } => Ok(()),
                other => Err(docker_err("ensure-volume", other)),
            })
    }

    /// Force-remove a volume. Missing volumes are not an error.
    pub async fn remove_volume(&self, ctx: &OpCtx, name: &str) -> Result<()> {
        let options = bollard::volume::RemoveVolumeOptions { force: true };
        let result = ctx
            .guard("remove-volume", self.client.docker().remove_volume(name, Some(options)))
            .await?;
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(docker_err("remove-volume", e)),
        }
    }

    /// Write text into `path` (relative to the volume root), creating
    /// parent directories.
    pub async fn write_file(
        &self,
        ctx: &OpCtx,
        volume: &str,
        path: &str,
        contents: &str,
    ) -> Result<()> {
        let target = join_mount(path)?;
        let parent = match target.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => MOUNT_POINT.to_string(),
        };
        let script = format!(
            "mkdir -p {} && printf '%s' {} > {}",
            shell_escape(&parent),
            shell_escape(contents),
            shell_escape(&target),
        );
        self.run(ctx, volume, &script, false).await.map(|_| ())
    }

    /// Read `path` back as raw bytes through the helper's log channel.
    pub async fn read_file(&self, ctx: &OpCtx, volume: &str, path: &str) -> Result<Vec<u8>> {
        let target = join_mount(path)?;
        self.run(ctx, volume, &format!("cat {}", shell_escape(&target)), true).await
    }

    /// Extract one member of a zip archive stored in the volume.
    pub async fn read_file_from_zip(
        &self,
        ctx: &OpCtx,
        volume: &str,
        archive: &str,
        member: &str,
    ) -> Result<Vec<u8>> {
        let target = join_mount(archive)?;
        let script = format!("unzip -p {} {}", shell_escape(&target), shell_escape(member));
        self.run(ctx, volume, &script, true).await
    }

    /// Remove a directory tree inside the volume.
    pub async fn remove_dir(&self, ctx: &OpCtx, volume: &str, path: &str) -> Result<()> {
        let target = join_mount(path)?;
        self.run(ctx, volume, &format!("rm -rf {}", shell_escape(&target)), false)
            .await
            .map(|_| ())
    }

    /// Run one helper container and return its demultiplexed stdout.
    async fn run(
        &self,
        ctx: &OpCtx,
        volume: &str,
        script: &str,
        read_only: bool,
    ) -> Result<Vec<u8>> {
        let docker = self.client.docker();
        let name = format!("quantflow-helper-{}", uuid::Uuid::new_v4().simple());

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()]),
            labels: Some(std::collections::HashMap::from([(
                LABEL_MANAGED.to_string(),
                "true".to_string(),
            )])),
            host_config: Some(HostConfig {
                network_mode: Some("none".to_string()),
                mounts: Some(vec![Mount {
                    target: Some(MOUNT_POINT.to_string()),
                    source: Some(volume.to_string()),
                    typ: Some(MountTypeEnum::VOLUME),
                    read_only: Some(read_only),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions { name: name.clone(), platform: None };
        ctx.guard("volume-helper", docker.create_container(Some(options), config))
            .await?
            .map_err(|e| docker_err("volume-helper", e))?;

        let outcome = self.drive(ctx, &name).await;

        // Helpers are disposable; removal failures only warn.
        let remove = RemoveContainerOptions { force: true, v: false, ..Default::default() };
        if let Err(e) = docker.remove_container(&name, Some(remove)).await {
            if !is_not_found(&e) {
                warn!(helper = %name, error = %e, "failed to remove helper container");
            }
        }

        outcome
    }

    /// Start the helper, wait for exit, collect stdout; fail on non-zero
    /// exit with stderr attached. Helper reads have no internal timeout —
    /// the caller's context bounds them.
    async fn drive(&self, ctx: &OpCtx, name: &str) -> Result<Vec<u8>> {
        let docker = self.client.docker();
        ctx.guard("volume-helper", docker.start_container(name, None::<StartContainerOptions<String>>))
            .await?
            .map_err(|e| docker_err("volume-helper", e))?;

        let mut wait = docker.wait_container(name, None::<WaitContainerOptions<String>>);
        let status = match ctx.guard("volume-helper", wait.next()).await? {
            Some(Ok(response)) => response.status_code,
            // The wait endpoint reports non-zero exits as an error body on
            // some daemon versions; the exit code still arrives.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(docker_err("volume-helper", e)),
            None => {
                return Err(Error::new(
                    "volume-helper",
                    ErrorKind::Other("helper wait stream ended without a status".into()),
                ))
            }
        };

        let (stdout, stderr) = self.collect_output(ctx, name).await?;
        if status != 0 {
            return Err(Error::new(
                "volume-helper",
                ErrorKind::Other(format!(
                    "helper exited with status {status}: {}",
                    String::from_utf8_lossy(&stderr).trim()
                )),
            ));
        }
        debug!(helper = %name, bytes = stdout.len(), "helper completed");
        Ok(stdout)
    }

    async fn collect_output(&self, ctx: &OpCtx, name: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };
        let mut logs = self.client.docker().logs(name, Some(options));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(frame) = ctx.guard("volume-helper", logs.next()).await? {
            match frame.map_err(|e| docker_err("volume-helper", e))? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.extend_from_slice(&message);
                }
                LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok((stdout, stderr))
    }
}

/// Join a volume-relative path under the mount point, refusing traversal.
fn join_mount(path: &str) -> Result<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(Error::validation("volume-helper", "empty volume path"));
    }
    if trimmed.split('/').any(|part| part == "..") {
        return Err(Error::validation(
            "volume-helper",
            format!("path '{path}' escapes the volume"),
        ));
    }
    Ok(format!("{MOUNT_POINT}/{trimmed}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_rooted_at_the_mount_point() {
        assert_eq!(join_mount("config.json").unwrap(), "/work/config.json");
        assert_eq!(
            join_mount("/backtest_results/.last_result.json").unwrap(),
            "/work/backtest_results/.last_result.json"
        );
    }

    #[test]
    fn traversal_and_empty_paths_are_rejected() {
        assert!(join_mount("").is_err());
        assert!(join_mount("/").is_err());
        assert!(join_mount("../etc/passwd").is_err());
        assert!(join_mount("a/../../b").is_err());
    }
}
