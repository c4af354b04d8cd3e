//! Cgroup limits derived from a resource allocation.
//!
//! The container runtime enforces these through cgroups v2 (`cpu.max`,
//! `memory.max`, `pids.max`); this module only computes the values in the
//! runtime's native units.

use devcell_common::constants::{CONTAINER_PIDS_LIMIT, MIB};
use devcell_common::types::ResourceAllocation;

/// Nano-CPUs per core, the runtime's CPU unit.
pub const NANO_CPUS_PER_CORE: i64 = 1_000_000_000;

/// Limits applied to one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgroupLimits {
    /// CPU quota in billionths of a core.
    pub nano_cpus: i64,
    /// Hard memory limit in bytes.
    pub memory_bytes: i64,
    /// Memory plus swap limit in bytes. Equal to `memory_bytes`, so no swap.
    pub memory_swap_bytes: i64,
    /// Maximum number of processes.
    pub pids_limit: i64,
}

impl CgroupLimits {
    /// Computes the limits for an allocation.
    #[must_use]
    pub fn from_allocation(allocation: &ResourceAllocation) -> Self {
        let memory_bytes = memory_bytes(allocation.memory_mb);
        Self {
            nano_cpus: nano_cpus(allocation.cpu_cores),
            memory_bytes,
            memory_swap_bytes: memory_bytes,
            pids_limit: CONTAINER_PIDS_LIMIT,
        }
    }
}

/// Converts whole cores to nano-CPUs.
#[must_use]
pub const fn nano_cpus(cores: u32) -> i64 {
    cores as i64 * NANO_CPUS_PER_CORE
}

/// Converts MiB to bytes.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub const fn memory_bytes(memory_mb: u32) -> i64 {
    (memory_mb as u64 * MIB) as i64
}
