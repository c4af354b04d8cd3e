//! Container runtime abstraction.
//!
//! The lifecycle manager only talks to [`ContainerRuntime`]. The production
//! implementation is [`docker::DockerRuntime`]; tests substitute an
//! in-memory fake.

pub mod docker;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use devcell_common::error::{DevcellError, Result};
use devcell_common::types::RuntimeId;
use devcell_core::capability::CapabilityPolicy;
use devcell_core::limits::CgroupLimits;

use crate::exec::ExecOutput;

/// `kind` of the [`DevcellError::NotFound`] a runtime returns when the
/// container object no longer exists.
pub const RUNTIME_CONTAINER: &str = "runtime container";

/// Whether `err` means the runtime container object is gone.
#[must_use]
pub fn is_missing(err: &DevcellError) -> bool {
    matches!(err, DevcellError::NotFound { kind, .. } if *kind == RUNTIME_CONTAINER)
}

/// Builds the error a runtime returns for a missing container object.
pub fn missing(id: impl Into<String>) -> DevcellError {
    DevcellError::NotFound {
        kind: RUNTIME_CONTAINER,
        id: id.into(),
    }
}

/// A host directory bound into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBind {
    /// Host path.
    pub host_path: PathBuf,
    /// Path inside the container.
    pub container_path: String,
    /// Mount read-only.
    pub read_only: bool,
}

impl VolumeBind {
    /// Renders the runtime bind syntax `host:container[:ro]`.
    #[must_use]
    pub fn to_bind_string(&self) -> String {
        let mut bind = format!("{}:{}", self.host_path.display(), self.container_path);
        if self.read_only {
            bind.push_str(":ro");
        }
        bind
    }
}

/// Restart behavior requested from the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Never restart.
    No,
    /// Restart unless explicitly stopped.
    UnlessStopped,
}

/// Everything the runtime needs to create a development container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name (`<prefix><username>`).
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Hostname inside the container.
    pub hostname: String,
    /// Environment variables.
    pub env: Vec<(String, String)>,
    /// Bind mounts.
    pub binds: Vec<VolumeBind>,
    /// Host port forwarded to container port 22.
    pub ssh_port: u16,
    /// Network the container joins.
    pub network: String,
    /// CPU, memory, and process limits.
    pub limits: CgroupLimits,
    /// Capability drop and add sets.
    pub capabilities: CapabilityPolicy,
    /// Security options (`no-new-privileges:true`).
    pub security_opts: Vec<String>,
    /// Restart policy.
    pub restart: RestartPolicy,
}

/// Container state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedState {
    /// Created but never started.
    Created,
    /// Running.
    Running,
    /// Paused.
    Paused,
    /// Being restarted by the runtime.
    Restarting,
    /// Being removed.
    Removing,
    /// Exited with the given code.
    Exited {
        /// Exit code of the main process.
        code: i64,
    },
    /// Dead after a failed removal or kill.
    Dead,
    /// The runtime reported no state.
    Unknown,
}

impl ObservedState {
    /// Whether the container counts as running for reconciliation.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Restarting)
    }

    /// Whether the container has stopped.
    #[must_use]
    pub const fn is_stopped(self) -> bool {
        matches!(self, Self::Exited { .. } | Self::Dead | Self::Created)
    }

    /// Short lower-case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited { .. } => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ObservedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exited ({code})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One-shot resource statistics of a container.
///
/// CPU counters are cumulative nanoseconds; the `pre` values are the
/// runtime's previous reading, so a single sample yields a rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceStats {
    /// Container CPU time.
    pub cpu_total_ns: u64,
    /// Container CPU time at the previous reading.
    pub precpu_total_ns: u64,
    /// Host CPU time.
    pub system_cpu_ns: u64,
    /// Host CPU time at the previous reading.
    pub presystem_cpu_ns: u64,
    /// CPUs visible to the container.
    pub online_cpus: u32,
    /// Memory charged to the container, page cache included.
    pub memory_usage_bytes: u64,
    /// Page cache part of `memory_usage_bytes`.
    pub memory_cache_bytes: u64,
    /// Memory limit.
    pub memory_limit_bytes: u64,
    /// Bytes received over all interfaces.
    pub network_rx_bytes: u64,
    /// Bytes sent over all interfaces.
    pub network_tx_bytes: u64,
}

impl ResourceStats {
    /// CPU utilisation in percent of one core, so a container saturating
    /// two cores reports 200.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cpu_percent(&self) -> f64 {
        let cpu_delta = self.cpu_total_ns.saturating_sub(self.precpu_total_ns);
        let system_delta = self.system_cpu_ns.saturating_sub(self.presystem_cpu_ns);
        if cpu_delta == 0 || system_delta == 0 {
            return 0.0;
        }
        cpu_delta as f64 / system_delta as f64 * f64::from(self.online_cpus.max(1)) * 100.0
    }

    /// Memory in use excluding page cache.
    #[must_use]
    pub const fn memory_used_bytes(&self) -> u64 {
        self.memory_usage_bytes.saturating_sub(self.memory_cache_bytes)
    }
}

/// Operations the lifecycle manager needs from a container runtime.
///
/// Every method that targets a container returns a
/// [`DevcellError::NotFound`] with kind [`RUNTIME_CONTAINER`] when the object
/// does not exist; see [`is_missing`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Verifies the runtime is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::Runtime`] if the runtime does not answer.
    async fn ping(&self) -> Result<()>;

    /// Creates (but does not start) a container.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::Runtime`] if the runtime rejects the spec.
    async fn create(&self, spec: &ContainerSpec) -> Result<RuntimeId>;

    /// Starts a container. Starting a running container succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is missing or fails to start.
    async fn start(&self, id: &RuntimeId) -> Result<()>;

    /// Stops a container, killing it after `grace`. Stopping a stopped
    /// container succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is missing or cannot be stopped.
    async fn stop(&self, id: &RuntimeId, grace: Duration) -> Result<()>;

    /// Force-removes a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is missing or cannot be removed.
    async fn remove(&self, id: &RuntimeId) -> Result<()>;

    /// Reports the container's current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is missing or cannot be inspected.
    async fn inspect(&self, id: &RuntimeId) -> Result<ObservedState>;

    /// Takes a one-shot statistics sample.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is missing or has no statistics.
    async fn stats(&self, id: &RuntimeId) -> Result<ResourceStats>;

    /// Runs a command inside the container and collects its output.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is missing or the exec fails.
    async fn exec(&self, id: &RuntimeId, command: &[String]) -> Result<ExecOutput>;
}
