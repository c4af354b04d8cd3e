//! System-wide constants and default paths.

use std::ops::RangeInclusive;

/// Default configuration file location.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/devcell/devcell.toml";

/// Default data directory for the state index or database.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/devcell";

/// Fast-tier root holding per-user workspace images.
pub const DEFAULT_SSD_ROOT: &str = "/data/ssd/containers";
/// Capacity-tier root holding per-user storage images.
pub const DEFAULT_HDD_ROOT: &str = "/data/hdd/containers";
/// Host directory bind-mounted read-only into every container.
pub const DEFAULT_SHARED_ROOT: &str = "/data/hdd/shared";

/// Container image used for every development environment.
pub const DEFAULT_CONTAINER_IMAGE: &str = "devcell-devenv:latest";
/// Isolated network every container is attached to.
pub const DEFAULT_NETWORK: &str = "devcell-network";
/// Prefix for runtime container names (`<prefix><username>`).
pub const DEFAULT_CONTAINER_PREFIX: &str = "devcell-";

/// In-container path of the fast-tier volume.
pub const WORKSPACE_MOUNT_PATH: &str = "/workspace";
/// In-container path of the capacity-tier volume.
pub const STORAGE_MOUNT_PATH: &str = "/storage";
/// In-container path of the shared read-only volume.
pub const SHARED_MOUNT_PATH: &str = "/shared";

/// Lowest SSH forwarding port handed out by default.
pub const DEFAULT_SSH_PORT_MIN: u16 = 2230;
/// Highest SSH forwarding port handed out by default.
pub const DEFAULT_SSH_PORT_MAX: u16 = 2250;

/// Default CPU cores for a new container.
pub const DEFAULT_CPU_CORES: u32 = 2;
/// Default memory in MiB for a new container.
pub const DEFAULT_MEMORY_MB: u32 = 8192;
/// Default fast-tier quota in GiB.
pub const DEFAULT_STORAGE_SSD_GB: u32 = 50;
/// Default capacity-tier quota in GiB.
pub const DEFAULT_STORAGE_HDD_GB: u32 = 200;

/// Accepted CPU core counts.
pub const CPU_CORES_RANGE: RangeInclusive<u32> = 1..=8;
/// Accepted memory sizes in MiB.
pub const MEMORY_MB_RANGE: RangeInclusive<u32> = 1024..=32768;
/// Accepted fast-tier quotas in GiB.
pub const STORAGE_SSD_GB_RANGE: RangeInclusive<u32> = 0..=200;
/// Accepted capacity-tier quotas in GiB.
pub const STORAGE_HDD_GB_RANGE: RangeInclusive<u32> = 0..=1000;

/// Maximum number of processes inside a container.
pub const CONTAINER_PIDS_LIMIT: i64 = 500;

/// Unprivileged user owning the mount roots inside containers.
pub const CONTAINER_UID: u32 = 1000;
/// Group of the unprivileged container user.
pub const CONTAINER_GID: u32 = 1000;

/// Per-call budget for a privileged host command.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;
/// Budget for a single container runtime call.
pub const DEFAULT_RUNTIME_TIMEOUT_SECS: u64 = 60;
/// Grace period given to a container on stop.
pub const DEFAULT_STOP_GRACE_SECS: u64 = 10;
/// Interval between reconciler passes.
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 300;

/// Bytes in one GiB, the unit of every storage quota.
pub const GIB: u64 = 1024 * 1024 * 1024;
/// Bytes in one MiB, the unit of memory allocations.
pub const MIB: u64 = 1024 * 1024;

/// Application name used in CLI output and log targets.
pub const APP_NAME: &str = "devcell";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "devcellctl";
