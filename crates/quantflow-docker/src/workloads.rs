// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Long-running workload control on a container daemon
//!
//! Create materializes the four config layers and the strategy source
//! under the workload's user-data directory — bind-mounted from a host
//! scratch directory when the daemon is local, shipped into a named volume
//! through the helper when it is remote — then issues the daemon's create
//! and start primitives. Failures unwind whatever was already
//! materialized.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StatsOptions,
    StopContainerOptions, UpdateContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::auth::DockerCredentials;
use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, info, warn};

use quantflow::error::{Error, ErrorKind, Result};
use quantflow::layout;
use quantflow::logs::{LogOptions, LogStream};
use quantflow::naming::{bot_labels, bot_object_name, LABEL_BOT_ID, LABEL_MANAGED};
use quantflow::status::{ResourceUsage, WorkloadState, WorkloadStatus};
use quantflow::workload::{
    BotSpec, ConfigLayerKind, SubstrateHandle, WorkloadId, WorkloadUpdate, CPU_QUOTA_PERIOD_US,
};
use quantflow::{OpCtx, SubstrateKind, WorkloadController};

use crate::client::{
    docker_err, is_not_found, parse_docker_time, DockerClient, STOP_GRACE_SECS,
};
use crate::logstream;
use crate::stats::{is_healthy, map_container_state, usage_from_stats};
use crate::volumes::VolumeHelper;

/// Network workloads attach to when neither the spec nor the runner pins
/// one.
const DEFAULT_NETWORK: &str = "quantflow";

/// Container-daemon implementation of [`WorkloadController`].
pub struct DockerWorkloads {
    client: DockerClient,
    helper: VolumeHelper,
}

impl DockerWorkloads {
    /// Driver over an established daemon connection.
    #[must_use]
    pub fn new(client: DockerClient) -> Self {
        let helper = VolumeHelper::new(client.clone());
        Self { client, helper }
    }

    fn volume_name(id: &WorkloadId) -> String {
        format!("{}-data", bot_object_name(id))
    }

    /// Ensure the private workload network exists. Idempotent.
    async fn ensure_network(&self, ctx: &OpCtx, name: &str) -> Result<()> {
        let docker = self.client.docker();
        let inspect = ctx
            .guard(
                "ensure-network",
                docker.inspect_network(name, None::<InspectNetworkOptions<String>>),
            )
            .await?;
        match inspect {
            Ok(_) => return Ok(()),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(docker_err("ensure-network", e)),
        }

        let options = CreateNetworkOptions {
            name: name.to_string(),
            check_duplicate: true,
            ..Default::default()
        };
        match ctx.guard("ensure-network", docker.create_network(options)).await? {
            Ok(_) => {
                info!(network = name, "created workload network");
                Ok(())
            }
            // Lost a create race; the network exists, which is what we want.
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }) => {
                Ok(())
            }
            Err(e) => Err(docker_err("ensure-network", e)),
        }
    }

    /// Ensure the workload image is present, pulling with registry
    /// credentials when the runner has any.
    async fn ensure_image(&self, ctx: &OpCtx, image: &str) -> Result<()> {
        let credentials = self.client.config().registry.as_ref().map(|auth| DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            serveraddress: auth.server.clone(),
            ..Default::default()
        });
        let options = CreateImageOptions { from_image: image.to_string(), ..Default::default() };
        let mut pull = self.client.docker().create_image(Some(options), None, credentials);
        while let Some(progress) = ctx.guard("ensure-image", pull.next()).await? {
            progress.map_err(|e| docker_err("ensure-image", e))?;
        }
        debug!(image, "workload image present");
        Ok(())
    }

    /// Materialize config layers and strategy source; returns the mount to
    /// attach.
    async fn materialize(&self, ctx: &OpCtx, spec: &BotSpec) -> Result<Mount> {
        let layer_files: Vec<(String, String)> = {
            let mut files = Vec::new();
            for (kind, layer) in spec.config.ordered() {
                let rendered = serde_json::to_string_pretty(&serde_json::Value::Object(
                    layer.clone(),
                ))
                .map_err(|e| Error::new("create", ErrorKind::Serialization(e)))?;
                files.push((kind.file_name().to_string(), rendered));
            }
            files.push((
                format!("strategies/{}", spec.strategy_file_name()),
                spec.strategy_code.clone(),
            ));
            files
        };

        if self.client.is_remote() {
            let volume = Self::volume_name(&spec.id);
            self.helper.ensure_helper_image(ctx).await?;
            self.helper.ensure_volume(ctx, &volume).await?;
            for (path, contents) in &layer_files {
                self.helper.write_file(ctx, &volume, path, contents).await?;
            }
            Ok(Mount {
                target: Some(layout::bot_dir(&spec.id)),
                source: Some(volume),
                typ: Some(MountTypeEnum::VOLUME),
                ..Default::default()
            })
        } else {
            let dir = self.client.scratch_dir(&spec.id.to_string());
            for (path, contents) in &layer_files {
                let full = dir.join(path);
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::new("create", ErrorKind::Io(e)).with_workload(spec.id))?;
                }
                std::fs::write(&full, contents)
                    .map_err(|e| Error::new("create", ErrorKind::Io(e)).with_workload(spec.id))?;
            }
            Ok(Mount {
                target: Some(layout::bot_dir(&spec.id)),
                source: Some(dir.to_string_lossy().into_owned()),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            })
        }
    }

    /// Best-effort removal of materialized artifacts.
    async fn remove_artifacts(&self, ctx: &OpCtx, id: &WorkloadId) {
        if self.client.is_remote() {
            if let Err(e) = self.helper.remove_volume(ctx, &Self::volume_name(id)).await {
                warn!(workload = %id, error = %e, "failed to remove workload volume");
            }
        } else {
            let dir = self.client.scratch_dir(&id.to_string());
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(workload = %id, error = %e, "failed to remove scratch directory");
                }
            }
        }
    }

    async fn resolve(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<Option<String>> {
        self.client
            .find_container(ctx, &bot_object_name(id), LABEL_BOT_ID, &id.to_string())
            .await
    }

    async fn resolve_required(&self, ctx: &OpCtx, operation: &str, id: &WorkloadId) -> Result<String> {
        self.resolve(ctx, id).await?.ok_or_else(|| {
            Error::not_found(operation, bot_object_name(id)).with_workload(*id)
        })
    }

    async fn inspect(&self, ctx: &OpCtx, container: &str) -> Result<ContainerInspectResponse> {
        ctx.guard(
            "get-status",
            self.client.docker().inspect_container(container, None::<InspectContainerOptions>),
        )
        .await?
        .map_err(|e| docker_err("get-status", e))
    }

    /// One stats sample, or zeros when the workload is not running.
    async fn sample_usage(&self, ctx: &OpCtx, container: &str, running: bool) -> ResourceUsage {
        if !running {
            return ResourceUsage::default();
        }
        let options = StatsOptions { stream: false, one_shot: false };
        let mut stream = self.client.docker().stats(container, Some(options));
        match ctx.guard("get-status", stream.next()).await {
            Ok(Some(Ok(stats))) => usage_from_stats(&stats),
            _ => ResourceUsage::default(),
        }
    }

    async fn status_of(&self, ctx: &OpCtx, container: &str, id: WorkloadId) -> Result<WorkloadStatus> {
        let details = self.inspect(ctx, container).await?;
        let state = details.state.clone().unwrap_or_default();
        let workload_state = map_container_state(&state);
        let running = matches!(workload_state, WorkloadState::Running | WorkloadState::Unhealthy);
        let usage = self.sample_usage(ctx, container, running).await;

        let ip_address = details.network_settings.as_ref().and_then(|settings| {
            settings.networks.as_ref().and_then(|networks| {
                networks
                    .values()
                    .filter_map(|endpoint| endpoint.ip_address.clone())
                    .find(|ip| !ip.is_empty())
            })
        });

        let host_port = details.network_settings.as_ref().and_then(|settings| {
            settings.ports.as_ref().and_then(|ports| {
                ports.values().flatten().flatten().find_map(|binding: &PortBinding| {
                    binding.host_port.as_ref().and_then(|p| p.parse::<u16>().ok())
                })
            })
        });

        Ok(WorkloadStatus {
            id,
            state: workload_state,
            handle: details.id.map(SubstrateHandle::new),
            healthy: is_healthy(&state),
            last_seen: Utc::now(),
            usage,
            ip_address,
            host_port,
            error: state.error.filter(|e| !e.is_empty()),
            created_at: parse_docker_time(details.created.as_ref()),
            started_at: parse_docker_time(state.started_at.as_ref()),
            stopped_at: parse_docker_time(state.finished_at.as_ref()),
        })
    }
}

#[async_trait]
impl WorkloadController for DockerWorkloads {
    async fn create(&self, ctx: &OpCtx, spec: &BotSpec) -> Result<SubstrateHandle> {
        spec.validate()?;
        let name = bot_object_name(&spec.id);

        let network = spec
            .network
            .clone()
            .or_else(|| self.client.config().network.clone())
            .unwrap_or_else(|| DEFAULT_NETWORK.to_string());
        self.ensure_network(ctx, &network).await.map_err(|e| e.with_workload(spec.id))?;
        self.ensure_image(ctx, &spec.image).await.map_err(|e| e.with_workload(spec.id))?;

        let mount = match self.materialize(ctx, spec).await {
            Ok(mount) => mount,
            Err(e) => {
                // A cancelled or failed materialization leaves no artifacts.
                self.remove_artifacts(ctx, &spec.id).await;
                return Err(e.with_workload(spec.id));
            }
        };

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let api_port = format!("{}/tcp", spec.api_port);
        let port_bindings = HashMap::from([(
            api_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                // Empty host port asks the daemon for a random allocation.
                host_port: Some(String::new()),
            }]),
        )]);

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(layout::trade_command(spec)),
            env: Some(env),
            labels: Some(bot_labels(&spec.id, &spec.name)),
            exposed_ports: Some(HashMap::from([(api_port, HashMap::new())])),
            host_config: Some(HostConfig {
                memory: spec.limits.memory_bytes,
                cpu_quota: spec.limits.cpu_quota_us(),
                cpu_period: spec.limits.cpus.map(|_| CPU_QUOTA_PERIOD_US),
                network_mode: Some(network),
                mounts: Some(vec![mount]),
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions { name: name.clone(), platform: None };
        let created = ctx
            .guard("create", self.client.docker().create_container(Some(options), config))
            .await
            .and_then(|r| r.map_err(|e| docker_err("create", e)));
        let created = match created {
            Ok(created) => created,
            Err(e) => {
                self.remove_artifacts(ctx, &spec.id).await;
                return Err(e.with_workload(spec.id));
            }
        };

        let started = ctx
            .guard("create", self.client.docker().start_container(&name, None::<StartContainerOptions<String>>))
            .await
            .and_then(|r| r.map_err(|e| docker_err("create", e)));
        if let Err(e) = started {
            let remove = RemoveContainerOptions { force: true, v: true, ..Default::default() };
            if let Err(remove_err) =
                self.client.docker().remove_container(&name, Some(remove)).await
            {
                warn!(workload = %spec.id, error = %remove_err, "failed to unwind created container");
            }
            self.remove_artifacts(ctx, &spec.id).await;
            return Err(e.with_workload(spec.id));
        }

        info!(workload = %spec.id, container = %name, "workload created and started");
        Ok(SubstrateHandle::new(created.id))
    }

    async fn delete(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        if let Some(container) = self.resolve(ctx, id).await? {
            let remove = RemoveContainerOptions { force: true, v: true, ..Default::default() };
            let removed = ctx
                .guard("delete", self.client.docker().remove_container(&container, Some(remove)))
                .await?;
            match removed {
                Ok(()) => {}
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(docker_err("delete", e).with_workload(*id)),
            }
        }
        self.remove_artifacts(ctx, id).await;
        debug!(workload = %id, "workload deleted");
        Ok(())
    }

    async fn start(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        let container = self.resolve_required(ctx, "start", id).await?;
        ctx.guard("start", self.client.docker().start_container(&container, None::<StartContainerOptions<String>>))
            .await?
            .map_err(|e| docker_err("start", e).with_workload(*id))
    }

    async fn stop(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        let container = self.resolve_required(ctx, "stop", id).await?;
        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        ctx.guard("stop", self.client.docker().stop_container(&container, Some(options)))
            .await?
            .map_err(|e| docker_err("stop", e).with_workload(*id))
    }

    async fn restart(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        let container = self.resolve_required(ctx, "restart", id).await?;
        let options = RestartContainerOptions { t: STOP_GRACE_SECS as isize };
        ctx.guard("restart", self.client.docker().restart_container(&container, Some(options)))
            .await?
            .map_err(|e| docker_err("restart", e).with_workload(*id))
    }

    async fn status(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<WorkloadStatus> {
        let container = self.resolve_required(ctx, "get-status", id).await?;
        self.status_of(ctx, &container, *id).await.map_err(|e| e.with_workload(*id))
    }

    async fn workload_ip(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<Option<String>> {
        let status = self.status(ctx, id).await?;
        Ok(status.ip_address)
    }

    async fn logs(&self, ctx: &OpCtx, id: &WorkloadId, options: LogOptions) -> Result<LogStream> {
        let container = self.resolve_required(ctx, "get-logs", id).await?;
        Ok(logstream::open(&self.client, &container, &options))
    }

    async fn update(&self, ctx: &OpCtx, id: &WorkloadId, update: &WorkloadUpdate) -> Result<()> {
        if update.image.is_some() {
            return Err(Error::new(
                "update",
                ErrorKind::Validation(
                    "image changes require recreating the workload".to_string(),
                ),
            )
            .with_workload(*id));
        }
        let Some(limits) = update.limits else {
            return Ok(());
        };
        let container = self.resolve_required(ctx, "update", id).await?;
        let options = UpdateContainerOptions::<String> {
            memory: limits.memory_bytes,
            cpu_quota: limits.cpu_quota_us(),
            cpu_period: limits.cpus.map(|_| CPU_QUOTA_PERIOD_US),
            ..Default::default()
        };
        ctx.guard("update", self.client.docker().update_container(&container, options))
            .await?
            .map_err(|e| docker_err("update", e).with_workload(*id))
    }

    async fn list(&self, ctx: &OpCtx) -> Result<Vec<WorkloadStatus>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{LABEL_MANAGED}=true")]);
        let options = ListContainersOptions { all: true, filters, ..Default::default() };
        let containers = ctx
            .guard("list", self.client.docker().list_containers(Some(options)))
            .await?
            .map_err(|e| docker_err("list", e))?;

        let mut statuses = Vec::new();
        for summary in containers {
            // Helper containers and one-shot jobs carry the managed label
            // but no bot id; skip them.
            let Some(id) = summary
                .labels
                .as_ref()
                .and_then(|labels| labels.get(LABEL_BOT_ID))
                .and_then(|raw| raw.parse::<WorkloadId>().ok())
            else {
                continue;
            };
            let Some(container) = summary.id else { continue };
            match self.status_of(ctx, &container, id).await {
                Ok(status) => statuses.push(status),
                Err(e) if matches!(e.kind(), ErrorKind::NotFound(_)) => {
                    // Removed between list and inspect.
                }
                Err(e) => return Err(e),
            }
        }
        Ok(statuses)
    }

    async fn health_check(&self, ctx: &OpCtx) -> Result<()> {
        self.client.health_check(ctx).await
    }

    async fn close(&self) -> Result<()> {
        self.client.close().await
    }

    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Docker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_name_derives_from_object_name() {
        let id: WorkloadId = "6e0fb9a2-44f5-4b5a-9c6e-0a4f6f8f2b11".parse().unwrap();
        assert_eq!(DockerWorkloads::volume_name(&id), format!("quantflow-bot-{id}-data"));
    }

    #[test]
    fn layer_files_follow_the_contract_order() {
        // The materialized file set mirrors ConfigLayerKind::ORDER plus the
        // strategy module; asserted here against the layout contract.
        let expected: Vec<&str> = ConfigLayerKind::ORDER.iter().map(|k| k.file_name()).collect();
        assert_eq!(
            expected,
            vec!["config.exchange.json", "config.strategy.json", "config.bot.json", "config.secure.json"]
        );
    }
}
