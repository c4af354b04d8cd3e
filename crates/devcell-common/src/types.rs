//! Domain primitive types used across the devcell workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{DevcellError, Result};

/// Identifier of the user owning a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Creates a user ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier the container runtime assigned to a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeId(String);

impl RuntimeId {
    /// Creates a runtime ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the short (12 character) form used in listings.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user known to the state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    /// Unique identifier.
    pub id: UserId,
    /// Login name; becomes a path component and part of the container name.
    pub username: String,
}

impl UserAccount {
    /// Creates an account after validating the username.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::Validation`] if the username is unsafe to use
    /// as a path component or container name.
    pub fn new(id: UserId, username: impl Into<String>) -> Result<Self> {
        let username = username.into();
        validate_username(&username)?;
        Ok(Self { id, username })
    }
}

/// A public key authorized for a user's containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKey {
    /// Owner.
    pub user_id: UserId,
    /// Key in `authorized_keys` format.
    pub public_key: String,
    /// Inactive keys are kept for history but never injected.
    pub active: bool,
}

/// Checks that a username matches `^[a-z0-9][a-z0-9_-]{0,31}$`.
///
/// # Errors
///
/// Returns [`DevcellError::Validation`] for any other input.
pub fn validate_username(username: &str) -> Result<()> {
    let mut chars = username.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let valid_rest =
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid_first || !valid_rest || username.len() > 32 {
        return Err(DevcellError::validation(format!(
            "invalid username '{username}'"
        )));
    }
    Ok(())
}

/// Lifecycle status of a container record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerStatus {
    /// Record reserved; the runtime container does not exist yet.
    Creating,
    /// Runtime container is running.
    Running,
    /// Runtime container exists but is stopped.
    Stopped,
    /// Creation or a later operation failed; needs retry or rebuild.
    Error,
    /// Runtime container is being destroyed and recreated.
    Rebuilding,
}

impl ContainerStatus {
    /// Whether a record may move from `self` to `to`.
    ///
    /// Nothing ever moves back into `Creating`; a fresh record is the only
    /// way to be in that state.
    #[must_use]
    pub const fn allows(self, to: Self) -> bool {
        match (self, to) {
            (_, Self::Creating) => false,
            (Self::Creating, Self::Running | Self::Error) => true,
            (Self::Creating | Self::Rebuilding, _) => matches!(to, Self::Error),
            (Self::Running | Self::Stopped | Self::Error, _) => true,
        }
    }

    /// Whether a record in this status must carry a runtime id.
    #[must_use]
    pub const fn requires_runtime_id(self) -> bool {
        matches!(self, Self::Running | Self::Stopped)
    }

    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
            Self::Rebuilding => "REBUILDING",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerStatus {
    type Err = DevcellError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATING" => Ok(Self::Creating),
            "RUNNING" => Ok(Self::Running),
            "STOPPED" => Ok(Self::Stopped),
            "ERROR" => Ok(Self::Error),
            "REBUILDING" => Ok(Self::Rebuilding),
            other => Err(DevcellError::validation(format!(
                "unknown container status '{other}'"
            ))),
        }
    }
}

/// Durable description of a user's container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Record identifier.
    pub id: String,
    /// Owner; at most one record per user.
    pub user_id: UserId,
    /// Runtime container id, once the runtime instance exists.
    pub runtime_id: Option<RuntimeId>,
    /// Deterministic container name derived from the username.
    pub name: String,
    /// Host port forwarded to the container's SSH daemon.
    pub ssh_port: u16,
    /// Current lifecycle status.
    pub status: ContainerStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl ContainerRecord {
    /// Creates a record in `Creating` with no runtime id.
    #[must_use]
    pub fn reserve(user_id: UserId, name: String, ssh_port: u16) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            runtime_id: None,
            name,
            ssh_port,
            status: ContainerStatus::Creating,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the record to `to`, validating both the transition and the
    /// runtime id invariant.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::InvalidTransition`] for a forbidden move or a
    /// move into a status that needs a runtime id the record lacks.
    pub fn transition(&mut self, to: ContainerStatus) -> Result<()> {
        if !self.status.allows(to) || (to.requires_runtime_id() && self.runtime_id.is_none()) {
            return Err(DevcellError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Binds the runtime instance and moves to `Running`.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::InvalidTransition`] if the record cannot run.
    pub fn mark_running(&mut self, runtime_id: RuntimeId) -> Result<()> {
        if !self.status.allows(ContainerStatus::Running) {
            return Err(DevcellError::InvalidTransition {
                from: self.status,
                to: ContainerStatus::Running,
            });
        }
        self.runtime_id = Some(runtime_id);
        self.transition(ContainerStatus::Running)
    }

    /// Moves to `Error`, keeping any runtime instance that was created so
    /// it can be cleaned up later.
    ///
    /// # Errors
    ///
    /// Never fails in practice: every status may move to `Error`.
    pub fn mark_error(&mut self, runtime_id: Option<RuntimeId>) -> Result<()> {
        if runtime_id.is_some() {
            self.runtime_id = runtime_id;
        }
        self.transition(ContainerStatus::Error)
    }
}

/// One of the two independently sized storage volumes of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    /// Performance tier, mounted as the primary workspace.
    Fast,
    /// Bulk tier, mounted as secondary storage.
    Capacity,
}

impl StorageTier {
    /// Both tiers, fast first.
    pub const ALL: [Self; 2] = [Self::Fast, Self::Capacity];

    /// In-container mount path for this tier.
    #[must_use]
    pub const fn container_path(self) -> &'static str {
        match self {
            Self::Fast => constants::WORKSPACE_MOUNT_PATH,
            Self::Capacity => constants::STORAGE_MOUNT_PATH,
        }
    }
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => write!(f, "ssd"),
            Self::Capacity => write!(f, "hdd"),
        }
    }
}

/// Desired resources for a user, independent of any container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    /// Owner.
    pub user_id: UserId,
    /// CPU cores (1-8).
    pub cpu_cores: u32,
    /// Memory in MiB (1024-32768).
    pub memory_mb: u32,
    /// Fast-tier quota in GiB (0-200).
    pub storage_ssd_gb: u32,
    /// Capacity-tier quota in GiB (0-1000).
    pub storage_hdd_gb: u32,
}

impl ResourceAllocation {
    /// Allocation with the workspace defaults.
    #[must_use]
    pub const fn defaults(user_id: UserId) -> Self {
        Self {
            user_id,
            cpu_cores: constants::DEFAULT_CPU_CORES,
            memory_mb: constants::DEFAULT_MEMORY_MB,
            storage_ssd_gb: constants::DEFAULT_STORAGE_SSD_GB,
            storage_hdd_gb: constants::DEFAULT_STORAGE_HDD_GB,
        }
    }

    /// Quota for the given tier in GiB.
    #[must_use]
    pub const fn quota_gb(&self, tier: StorageTier) -> u32 {
        match tier {
            StorageTier::Fast => self.storage_ssd_gb,
            StorageTier::Capacity => self.storage_hdd_gb,
        }
    }

    /// Checks every field against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::Validation`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        check_range("cpu_cores", self.cpu_cores, &constants::CPU_CORES_RANGE)?;
        check_range("memory_mb", self.memory_mb, &constants::MEMORY_MB_RANGE)?;
        check_range(
            "storage_ssd_gb",
            self.storage_ssd_gb,
            &constants::STORAGE_SSD_GB_RANGE,
        )?;
        check_range(
            "storage_hdd_gb",
            self.storage_hdd_gb,
            &constants::STORAGE_HDD_GB_RANGE,
        )
    }
}

fn check_range(field: &str, value: u32, range: &std::ops::RangeInclusive<u32>) -> Result<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(DevcellError::validation(format!(
            "{field} must be within {}..={}, got {value}",
            range.start(),
            range.end()
        )))
    }
}

/// Optional overrides supplied when creating a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// CPU cores.
    pub cpu_cores: Option<u32>,
    /// Memory in MiB.
    pub memory_mb: Option<u32>,
    /// Fast-tier quota in GiB.
    pub storage_ssd_gb: Option<u32>,
    /// Capacity-tier quota in GiB.
    pub storage_hdd_gb: Option<u32>,
    /// Public key(s) to authorize inside the container.
    pub ssh_public_key: Option<String>,
}

impl ResourceRequest {
    /// Fills unset fields from the defaults and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::Validation`] if any value is out of range.
    pub fn resolve(&self, user_id: UserId) -> Result<ResourceAllocation> {
        let defaults = ResourceAllocation::defaults(user_id);
        let allocation = ResourceAllocation {
            cpu_cores: self.cpu_cores.unwrap_or(defaults.cpu_cores),
            memory_mb: self.memory_mb.unwrap_or(defaults.memory_mb),
            storage_ssd_gb: self.storage_ssd_gb.unwrap_or(defaults.storage_ssd_gb),
            storage_hdd_gb: self.storage_hdd_gb.unwrap_or(defaults.storage_hdd_gb),
            ..defaults
        };
        allocation.validate()?;
        Ok(allocation)
    }
}

/// Kinds of audited lifecycle activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityKind {
    /// Container created.
    ContainerCreate,
    /// Container started.
    ContainerStart,
    /// Container stopped.
    ContainerStop,
    /// Container restarted.
    ContainerRestart,
    /// Container destroyed and recreated.
    ContainerRebuild,
    /// Container removed.
    ContainerRemove,
    /// Storage quota applied.
    StorageResize,
    /// CPU or memory allocation changed.
    ResourceUpdate,
}

impl ActivityKind {
    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ContainerCreate => "CONTAINER_CREATE",
            Self::ContainerStart => "CONTAINER_START",
            Self::ContainerStop => "CONTAINER_STOP",
            Self::ContainerRestart => "CONTAINER_RESTART",
            Self::ContainerRebuild => "CONTAINER_REBUILD",
            Self::ContainerRemove => "CONTAINER_REMOVE",
            Self::StorageResize => "STORAGE_RESIZE",
            Self::ResourceUpdate => "RESOURCE_UPDATE",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityKind {
    type Err = DevcellError;

    fn from_str(s: &str) -> Result<Self> {
        [
            Self::ContainerCreate,
            Self::ContainerStart,
            Self::ContainerStop,
            Self::ContainerRestart,
            Self::ContainerRebuild,
            Self::ContainerRemove,
            Self::StorageResize,
            Self::ResourceUpdate,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == s)
        .ok_or_else(|| DevcellError::validation(format!("unknown activity kind '{s}'")))
    }
}

/// One audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// User the activity concerns.
    pub user_id: UserId,
    /// Activity kind.
    pub kind: ActivityKind,
    /// Human-readable description.
    pub description: String,
    /// When it happened.
    pub recorded_at: DateTime<Utc>,
}

impl ActivityEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(user_id: UserId, kind: ActivityKind, description: impl Into<String>) -> Self {
        Self {
            user_id,
            kind,
            description: description.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Point-in-time resource usage of a running container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    /// Record the sample belongs to.
    pub container_record_id: String,
    /// CPU usage as a percentage of one core times online CPUs.
    pub cpu_percent: f64,
    /// Memory in use, excluding page cache, in MiB.
    pub memory_used_mb: u64,
    /// Memory limit in MiB.
    pub memory_limit_mb: u64,
    /// Used bytes on the fast tier, in GiB.
    pub storage_ssd_used_gb: f64,
    /// Used bytes on the capacity tier, in GiB.
    pub storage_hdd_used_gb: f64,
    /// Total bytes received across interfaces.
    pub network_rx_bytes: u64,
    /// Total bytes sent across interfaces.
    pub network_tx_bytes: u64,
    /// When the sample was taken.
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ContainerRecord {
        ContainerRecord::reserve(UserId::new("u1"), "devcell-alice".into(), 2230)
    }

    #[test]
    fn reserved_record_is_creating_without_runtime_id() {
        let r = record();
        assert_eq!(r.status, ContainerStatus::Creating);
        assert!(r.runtime_id.is_none());
    }

    #[test]
    fn creating_cannot_become_running_without_runtime_id() {
        let mut r = record();
        let err = r.transition(ContainerStatus::Running).unwrap_err();
        assert!(matches!(err, DevcellError::InvalidTransition { .. }));
    }

    #[test]
    fn mark_running_binds_runtime_id() {
        let mut r = record();
        r.mark_running(RuntimeId::new("abc")).unwrap();
        assert_eq!(r.status, ContainerStatus::Running);
        assert_eq!(r.runtime_id, Some(RuntimeId::new("abc")));
    }

    #[test]
    fn stopped_cannot_go_back_to_creating() {
        let mut r = record();
        r.mark_running(RuntimeId::new("abc")).unwrap();
        r.transition(ContainerStatus::Stopped).unwrap();
        let err = r.transition(ContainerStatus::Creating).unwrap_err();
        assert!(matches!(
            err,
            DevcellError::InvalidTransition {
                from: ContainerStatus::Stopped,
                to: ContainerStatus::Creating
            }
        ));
    }

    #[test]
    fn creating_cannot_be_stopped() {
        assert!(!ContainerStatus::Creating.allows(ContainerStatus::Stopped));
        assert!(!ContainerStatus::Creating.allows(ContainerStatus::Rebuilding));
    }

    #[test]
    fn rebuilding_only_falls_into_error() {
        assert!(ContainerStatus::Rebuilding.allows(ContainerStatus::Error));
        assert!(!ContainerStatus::Rebuilding.allows(ContainerStatus::Running));
    }

    #[test]
    fn error_record_keeps_created_runtime_id() {
        let mut r = record();
        r.mark_error(Some(RuntimeId::new("half-made"))).unwrap();
        assert_eq!(r.status, ContainerStatus::Error);
        assert_eq!(r.runtime_id, Some(RuntimeId::new("half-made")));
        assert!(r.status.allows(ContainerStatus::Rebuilding));
    }

    #[test]
    fn status_parses_its_own_display() {
        for s in [
            ContainerStatus::Creating,
            ContainerStatus::Running,
            ContainerStatus::Stopped,
            ContainerStatus::Error,
            ContainerStatus::Rebuilding,
        ] {
            assert_eq!(s.to_string().parse::<ContainerStatus>().unwrap(), s);
        }
        assert!("running".parse::<ContainerStatus>().is_err());
    }

    #[test]
    fn request_defaults_fill_missing_fields() {
        let req = ResourceRequest {
            storage_hdd_gb: Some(0),
            ..ResourceRequest::default()
        };
        let alloc = req.resolve(UserId::new("u1")).unwrap();
        assert_eq!(alloc.cpu_cores, constants::DEFAULT_CPU_CORES);
        assert_eq!(alloc.storage_ssd_gb, constants::DEFAULT_STORAGE_SSD_GB);
        assert_eq!(alloc.storage_hdd_gb, 0);
    }

    #[test]
    fn request_rejects_out_of_range_values() {
        let req = ResourceRequest {
            cpu_cores: Some(9),
            ..ResourceRequest::default()
        };
        assert!(matches!(
            req.resolve(UserId::new("u1")),
            Err(DevcellError::Validation { .. })
        ));

        let req = ResourceRequest {
            storage_ssd_gb: Some(201),
            ..ResourceRequest::default()
        };
        assert!(req.resolve(UserId::new("u1")).is_err());
    }

    #[test]
    fn usernames_are_restricted_to_safe_characters() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("dev_01-x").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("../etc").is_err());
        assert!(validate_username("Alice").is_err());
        assert!(validate_username("-lead").is_err());
        assert!(validate_username(&"a".repeat(33)).is_err());
    }

    #[test]
    fn runtime_id_short_form() {
        let id = RuntimeId::new("0123456789abcdef");
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(RuntimeId::new("abc").short(), "abc");
    }
}
