//! Docker Engine runtime using bollard.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{
    ContainerCreateBody, ContainerStateStatusEnum, HostConfig, PortBinding, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use devcell_common::config::RuntimeConfig;
use devcell_common::error::{DevcellError, Result};
use devcell_common::types::RuntimeId;
use futures_util::StreamExt;
use tracing::instrument;

use super::{ContainerRuntime, ContainerSpec, ObservedState, ResourceStats, RestartPolicy};
use crate::exec::{self, ExecOutput};

/// Container port of the SSH daemon.
const SSH_CONTAINER_PORT: &str = "22/tcp";

/// Timeout in seconds for requests on an explicitly configured socket.
const SOCKET_TIMEOUT_SECS: u64 = 120;

/// Runtime backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime").finish_non_exhaustive()
    }
}

impl DockerRuntime {
    /// Connects to the daemon named in the configuration and pings it.
    ///
    /// Without an explicit socket the platform defaults are used
    /// (`/var/run/docker.sock` or `DOCKER_HOST`).
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::Runtime`] if the connection or the ping fails.
    pub async fn connect(config: &RuntimeConfig) -> Result<Self> {
        let docker = match config.docker_socket.as_deref() {
            Some(socket) => {
                Docker::connect_with_unix(socket, SOCKET_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| DevcellError::Runtime {
            operation: "connect",
            message: e.to_string(),
        })?;
        let runtime = Self::with_client(docker);
        runtime.ping().await?;
        tracing::info!("connected to Docker daemon");
        Ok(runtime)
    }

    /// Wraps a pre-configured client.
    #[must_use]
    pub const fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Maps a bollard error, turning 404 into the runtime's missing-object error.
fn map_err(operation: &'static str, id: &str, err: bollard::errors::Error) -> DevcellError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => super::missing(id),
        other => DevcellError::Runtime {
            operation,
            message: other.to_string(),
        },
    }
}

/// Whether the daemon answered "304 Not Modified" (already started or
/// already stopped).
const fn is_not_modified(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn build_host_config(spec: &ContainerSpec) -> HostConfig {
    let mut port_bindings = HashMap::new();
    let _ = port_bindings.insert(
        SSH_CONTAINER_PORT.to_string(),
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(spec.ssh_port.to_string()),
        }]),
    );

    let restart_policy = bollard::models::RestartPolicy {
        name: Some(match spec.restart {
            RestartPolicy::No => RestartPolicyNameEnum::NO,
            RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        }),
        maximum_retry_count: None,
    };

    HostConfig {
        binds: Some(spec.binds.iter().map(super::VolumeBind::to_bind_string).collect()),
        port_bindings: Some(port_bindings),
        nano_cpus: Some(spec.limits.nano_cpus),
        memory: Some(spec.limits.memory_bytes),
        memory_swap: Some(spec.limits.memory_swap_bytes),
        pids_limit: Some(spec.limits.pids_limit),
        security_opt: Some(spec.security_opts.clone()),
        cap_drop: Some(spec.capabilities.drop.clone()),
        cap_add: Some(spec.capabilities.add.clone()),
        restart_policy: Some(restart_policy),
        network_mode: Some(spec.network.clone()),
        ..Default::default()
    }
}

fn build_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    ContainerCreateBody {
        image: Some(spec.image.clone()),
        hostname: Some(spec.hostname.clone()),
        env: Some(env),
        exposed_ports: Some(vec![SSH_CONTAINER_PORT.to_string()]),
        host_config: Some(build_host_config(spec)),
        ..Default::default()
    }
}

fn map_state(status: Option<ContainerStateStatusEnum>, exit_code: Option<i64>) -> ObservedState {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => ObservedState::Created,
        Some(ContainerStateStatusEnum::RUNNING) => ObservedState::Running,
        Some(ContainerStateStatusEnum::PAUSED) => ObservedState::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => ObservedState::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => ObservedState::Removing,
        Some(ContainerStateStatusEnum::EXITED) => ObservedState::Exited {
            code: exit_code.unwrap_or(0),
        },
        Some(ContainerStateStatusEnum::DEAD) => ObservedState::Dead,
        None | Some(ContainerStateStatusEnum::EMPTY) => ObservedState::Unknown,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        let _ = self
            .docker
            .ping()
            .await
            .map_err(|e| DevcellError::Runtime {
                operation: "ping",
                message: e.to_string(),
            })?;
        Ok(())
    }

    #[instrument(skip(self, spec), fields(container = %spec.name, image = %spec.image))]
    async fn create(&self, spec: &ContainerSpec) -> Result<RuntimeId> {
        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        };
        let response = self
            .docker
            .create_container(Some(options), build_body(spec))
            .await
            .map_err(|e| DevcellError::Runtime {
                operation: "create",
                message: e.to_string(),
            })?;
        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, warning = %warning, "runtime warning on create");
        }
        tracing::info!(container = %spec.name, id = %response.id, "container created");
        Ok(RuntimeId::new(response.id))
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn start(&self, id: &RuntimeId) -> Result<()> {
        match self
            .docker
            .start_container(id.as_str(), None::<StartContainerOptions>)
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_modified(&e) => {
                tracing::debug!(id = %id, "container already running");
            }
            Err(e) => return Err(map_err("start", id.as_str(), e)),
        }
        tracing::info!(id = %id, "container started");
        Ok(())
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn stop(&self, id: &RuntimeId, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: Some(i32::try_from(grace.as_secs()).unwrap_or(i32::MAX)),
            signal: None,
        };
        match self.docker.stop_container(id.as_str(), Some(options)).await {
            Ok(()) => {}
            Err(e) if is_not_modified(&e) => {
                tracing::debug!(id = %id, "container already stopped");
            }
            Err(e) => return Err(map_err("stop", id.as_str(), e)),
        }
        tracing::info!(id = %id, "container stopped");
        Ok(())
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn remove(&self, id: &RuntimeId) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id.as_str(), Some(options))
            .await
            .map_err(|e| map_err("remove", id.as_str(), e))?;
        tracing::info!(id = %id, "container removed");
        Ok(())
    }

    async fn inspect(&self, id: &RuntimeId) -> Result<ObservedState> {
        let inspect = self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err("inspect", id.as_str(), e))?;
        let state = inspect
            .state
            .map_or(ObservedState::Unknown, |s| map_state(s.status, s.exit_code));
        tracing::debug!(id = %id, state = %state, "inspected container");
        Ok(state)
    }

    async fn stats(&self, id: &RuntimeId) -> Result<ResourceStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(id.as_str(), Some(options));
        let stats = stream
            .next()
            .await
            .ok_or_else(|| DevcellError::Runtime {
                operation: "stats",
                message: "no stats available".to_string(),
            })?
            .map_err(|e| map_err("stats", id.as_str(), e))?;

        let cpu_total_ns = stats
            .cpu_stats
            .as_ref()
            .and_then(|s| s.cpu_usage.as_ref())
            .and_then(|u| u.total_usage)
            .unwrap_or(0);
        let system_cpu_ns = stats
            .cpu_stats
            .as_ref()
            .and_then(|s| s.system_cpu_usage)
            .unwrap_or(0);
        let online_cpus = stats
            .cpu_stats
            .as_ref()
            .and_then(|s| s.online_cpus)
            .unwrap_or(1);
        let precpu_total_ns = stats
            .precpu_stats
            .as_ref()
            .and_then(|s| s.cpu_usage.as_ref())
            .and_then(|u| u.total_usage)
            .unwrap_or(0);
        let presystem_cpu_ns = stats
            .precpu_stats
            .as_ref()
            .and_then(|s| s.system_cpu_usage)
            .unwrap_or(0);

        let memory = stats.memory_stats.as_ref();
        let memory_usage_bytes = memory.and_then(|m| m.usage).unwrap_or(0);
        let memory_limit_bytes = memory.and_then(|m| m.limit).unwrap_or(0);
        // cgroup v1 reports "cache", cgroup v2 "inactive_file".
        let memory_cache_bytes = memory
            .and_then(|m| m.stats.as_ref())
            .and_then(|s| s.get("cache").or_else(|| s.get("inactive_file")).copied())
            .unwrap_or(0);

        let (network_rx_bytes, network_tx_bytes) = stats
            .networks
            .as_ref()
            .map(|networks| {
                networks.values().fold((0_u64, 0_u64), |(rx, tx), n| {
                    (
                        rx.saturating_add(n.rx_bytes.unwrap_or(0)),
                        tx.saturating_add(n.tx_bytes.unwrap_or(0)),
                    )
                })
            })
            .unwrap_or_default();

        Ok(ResourceStats {
            cpu_total_ns,
            precpu_total_ns,
            system_cpu_ns,
            presystem_cpu_ns,
            online_cpus,
            memory_usage_bytes,
            memory_cache_bytes,
            memory_limit_bytes,
            network_rx_bytes,
            network_tx_bytes,
        })
    }

    #[instrument(skip(self, command), fields(id = %id))]
    async fn exec(&self, id: &RuntimeId, command: &[String]) -> Result<ExecOutput> {
        exec::validate_command(command)?;
        let options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(id.as_str(), options)
            .await
            .map_err(|e| map_err("exec", id.as_str(), e))?;

        let started = self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(|e| map_err("exec", id.as_str(), e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        match started {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(id = %id, error = %e, "error reading exec output");
                        }
                    }
                }
            }
            StartExecResults::Detached => {
                tracing::warn!(id = %id, "exec started detached");
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&created.id)
            .await
            .map_err(|e| map_err("exec", id.as_str(), e))?;
        let exit_code = inspected.exit_code.unwrap_or(-1);
        tracing::debug!(id = %id, exit_code, "exec finished");
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use devcell_core::capability::{DEV_ENVIRONMENT, least_privilege};
    use devcell_core::limits::CgroupLimits;

    use super::*;
    use crate::backend::VolumeBind;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "devcell-alice".into(),
            image: "devcell-devenv:latest".into(),
            hostname: "alice".into(),
            env: vec![("USERNAME".into(), "alice".into())],
            binds: vec![VolumeBind {
                host_path: PathBuf::from("/data/hdd/shared"),
                container_path: "/shared".into(),
                read_only: true,
            }],
            ssh_port: 2231,
            network: "devcell-network".into(),
            limits: CgroupLimits {
                nano_cpus: 2_000_000_000,
                memory_bytes: 1024,
                memory_swap_bytes: 1024,
                pids_limit: 500,
            },
            capabilities: least_privilege(DEV_ENVIRONMENT),
            security_opts: vec!["no-new-privileges:true".into()],
            restart: RestartPolicy::UnlessStopped,
        }
    }

    #[test]
    fn body_forwards_ssh_port_and_limits() {
        let body = build_body(&spec());
        assert_eq!(body.env, Some(vec!["USERNAME=alice".to_string()]));
        assert_eq!(body.hostname.as_deref(), Some("alice"));
        let host = body.host_config.unwrap();
        let bindings = host.port_bindings.unwrap();
        let ssh = bindings["22/tcp"].as_ref().unwrap();
        assert_eq!(ssh[0].host_port.as_deref(), Some("2231"));
        assert_eq!(host.pids_limit, Some(500));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(
            host.binds,
            Some(vec!["/data/hdd/shared:/shared:ro".to_string()])
        );
        assert_eq!(host.network_mode.as_deref(), Some("devcell-network"));
    }

    #[test]
    fn exited_state_keeps_exit_code() {
        assert_eq!(
            map_state(Some(ContainerStateStatusEnum::EXITED), Some(137)),
            ObservedState::Exited { code: 137 }
        );
        assert_eq!(map_state(None, None), ObservedState::Unknown);
    }

    #[test]
    fn not_found_maps_to_missing() {
        let err = map_err(
            "inspect",
            "abc",
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message: "No such container".into(),
            },
        );
        assert!(crate::backend::is_missing(&err));
    }
}
