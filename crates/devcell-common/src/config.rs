//! Global configuration model for devcell.
//!
//! Every section has defaults, so an empty or missing file yields a working
//! configuration for a single host with the standard `/data` layout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{DevcellError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DevcellConfig {
    /// Host storage layout.
    pub storage: StorageConfig,
    /// Container runtime settings.
    pub runtime: RuntimeConfig,
    /// SSH port range.
    pub ports: PortRangeConfig,
    /// Privileged host command execution.
    pub host: HostConfig,
    /// State store backend.
    pub state: StateConfig,
    /// Metrics and status reconciliation.
    pub reconciler: ReconcilerConfig,
}

impl DevcellConfig {
    /// Loads the configuration from a TOML file.
    ///
    /// A missing file is not an error: defaults are returned instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| DevcellError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::Config`] on syntax or validation errors.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| DevcellError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.ports.min == 0 || self.ports.min > self.ports.max {
            return Err(DevcellError::Config {
                message: format!(
                    "ports.min ({}) must be non-zero and not above ports.max ({})",
                    self.ports.min, self.ports.max
                ),
            });
        }
        for (name, path) in [
            ("storage.ssd_root", &self.storage.ssd_root),
            ("storage.hdd_root", &self.storage.hdd_root),
            ("storage.shared_root", &self.storage.shared_root),
        ] {
            if !path.is_absolute() {
                return Err(DevcellError::Config {
                    message: format!("{name} must be an absolute path: {}", path.display()),
                });
            }
        }
        if self.host.command_timeout_secs == 0 || self.runtime.timeout_secs == 0 {
            return Err(DevcellError::Config {
                message: "timeouts must be at least one second".into(),
            });
        }
        if self.reconciler.interval_secs == 0 {
            return Err(DevcellError::Config {
                message: "reconciler.interval_secs must be at least one second".into(),
            });
        }
        Ok(())
    }
}

/// Host storage layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Fast-tier root (`<root>/<username>/workspace.img`).
    pub ssd_root: PathBuf,
    /// Capacity-tier root (`<root>/<username>/storage.img`).
    pub hdd_root: PathBuf,
    /// Directory shared read-only with every container.
    pub shared_root: PathBuf,
    /// Owner uid applied to mount roots.
    pub container_uid: u32,
    /// Owner gid applied to mount roots.
    pub container_gid: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ssd_root: PathBuf::from(constants::DEFAULT_SSD_ROOT),
            hdd_root: PathBuf::from(constants::DEFAULT_HDD_ROOT),
            shared_root: PathBuf::from(constants::DEFAULT_SHARED_ROOT),
            container_uid: constants::CONTAINER_UID,
            container_gid: constants::CONTAINER_GID,
        }
    }
}

/// What happens to storage images when a container is removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionPolicy {
    /// Unmount but keep the images so a later container recovers the data.
    #[default]
    KeepImages,
    /// Unmount and delete the images.
    DeleteImages,
}

/// Container runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Docker socket; `None` uses the platform default.
    pub docker_socket: Option<String>,
    /// Development environment image.
    pub image: String,
    /// Network every container joins.
    pub network: String,
    /// Prefix of container names.
    pub name_prefix: String,
    /// Budget for a single runtime call, in seconds.
    pub timeout_secs: u64,
    /// Grace period on stop, in seconds.
    pub stop_grace_secs: u64,
    /// Image retention on container removal.
    pub retention: RetentionPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_socket: None,
            image: constants::DEFAULT_CONTAINER_IMAGE.into(),
            network: constants::DEFAULT_NETWORK.into(),
            name_prefix: constants::DEFAULT_CONTAINER_PREFIX.into(),
            timeout_secs: constants::DEFAULT_RUNTIME_TIMEOUT_SECS,
            stop_grace_secs: constants::DEFAULT_STOP_GRACE_SECS,
            retention: RetentionPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    /// Runtime call budget as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Inclusive SSH port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortRangeConfig {
    /// Lowest port.
    pub min: u16,
    /// Highest port.
    pub max: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            min: constants::DEFAULT_SSH_PORT_MIN,
            max: constants::DEFAULT_SSH_PORT_MAX,
        }
    }
}

/// Privileged host command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Prefix commands with `sudo -n` when not running as root.
    pub sudo: bool,
    /// Budget per host command, in seconds.
    pub command_timeout_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            sudo: true,
            command_timeout_secs: constants::DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

impl HostConfig {
    /// Host command budget as a [`Duration`].
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// State store backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// SQLite database with unique constraints.
    #[default]
    Sqlite,
    /// JSON index file.
    Json,
}

/// State store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    /// Backend kind.
    pub backend: StateBackend,
    /// Database or index file path.
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::default(),
            path: PathBuf::from(constants::DEFAULT_DATA_DIR).join("devcell.db"),
        }
    }
}

impl StateConfig {
    /// Directory holding the per-user lock files, next to the state file.
    #[must_use]
    pub fn lock_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map_or_else(|| PathBuf::from("locks"), |dir| dir.join("locks"))
    }
}

/// Reconciler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcilerConfig {
    /// Seconds between passes.
    pub interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: constants::DEFAULT_RECONCILE_INTERVAL_SECS,
        }
    }
}

impl ReconcilerConfig {
    /// Interval as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = DevcellConfig::from_toml("").unwrap();
        assert_eq!(config, DevcellConfig::default());
        assert_eq!(config.ports.min, 2230);
        assert_eq!(config.runtime.retention, RetentionPolicy::KeepImages);
    }

    #[test]
    fn partial_sections_override_defaults() {
        let config = DevcellConfig::from_toml(
            r#"
[ports]
min = 3000
max = 3010

[runtime]
retention = "delete-images"

[state]
backend = "json"
path = "/tmp/devcell/state.json"
"#,
        )
        .unwrap();
        assert_eq!(config.ports.min, 3000);
        assert_eq!(config.runtime.retention, RetentionPolicy::DeleteImages);
        assert_eq!(config.runtime.image, constants::DEFAULT_CONTAINER_IMAGE);
        assert_eq!(config.state.backend, StateBackend::Json);
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let err = DevcellConfig::from_toml("[ports]\nmin = 10\nmax = 5\n").unwrap_err();
        assert!(matches!(err, DevcellError::Config { .. }));
    }

    #[test]
    fn relative_storage_root_is_rejected() {
        let err = DevcellConfig::from_toml("[storage]\nssd_root = \"data/ssd\"\n").unwrap_err();
        assert!(err.to_string().contains("storage.ssd_root"));
    }

    #[test]
    fn zero_reconcile_interval_is_rejected() {
        let err = DevcellConfig::from_toml("[reconciler]\ninterval_secs = 0\n").unwrap_err();
        assert!(matches!(err, DevcellError::Config { .. }));
        assert!(err.to_string().contains("reconciler.interval_secs"));
    }

    #[test]
    fn lock_dir_sits_next_to_state_file() {
        let state = StateConfig {
            backend: StateBackend::Json,
            path: PathBuf::from("/var/lib/devcell/state.json"),
        };
        assert_eq!(state.lock_dir(), PathBuf::from("/var/lib/devcell/locks"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(DevcellConfig::from_toml("[ports]\nlow = 1\n").is_err());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = DevcellConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, DevcellConfig::default());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("devcell.toml");
        std::fs::write(&path, "[host]\nsudo = false\n").unwrap();
        let config = DevcellConfig::load(&path).unwrap();
        assert!(!config.host.sudo);
    }
}
