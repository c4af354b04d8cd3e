//! Linux capability policy for development containers.
//!
//! Every container starts with all capabilities dropped and only retains
//! the small set needed to manage files and switch users inside its own
//! home directory.

/// Linux capability identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Allow setting file ownership.
    Chown,
    /// Bypass file read, write, and execute permission checks.
    DacOverride,
    /// Bypass permission checks that require the file owner.
    Fowner,
    /// Allow setting group IDs.
    Setgid,
    /// Allow setting user IDs.
    Setuid,
    /// Allow binding to privileged ports (< 1024).
    NetBindService,
}

impl Capability {
    /// Name as understood by the container runtime.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Chown => "CHOWN",
            Self::DacOverride => "DAC_OVERRIDE",
            Self::Fowner => "FOWNER",
            Self::Setgid => "SETGID",
            Self::Setuid => "SETUID",
            Self::NetBindService => "NET_BIND_SERVICE",
        }
    }
}

/// Capabilities retained by every development container.
pub const DEV_ENVIRONMENT: &[Capability] = &[
    Capability::Chown,
    Capability::DacOverride,
    Capability::Fowner,
    Capability::Setgid,
    Capability::Setuid,
    Capability::NetBindService,
];

/// Capability sets handed to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityPolicy {
    /// Capabilities to drop.
    pub drop: Vec<String>,
    /// Capabilities to add back after the drop.
    pub add: Vec<String>,
}

/// Drops every capability and retains only those in `keep`.
#[must_use]
pub fn least_privilege(keep: &[Capability]) -> CapabilityPolicy {
    tracing::debug!(retained = keep.len(), "building capability policy");
    CapabilityPolicy {
        drop: vec!["ALL".to_string()],
        add: keep.iter().map(|c| c.name().to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_environment_drops_all_and_adds_six() {
        let policy = least_privilege(DEV_ENVIRONMENT);
        assert_eq!(policy.drop, ["ALL"]);
        assert_eq!(
            policy.add,
            [
                "CHOWN",
                "DAC_OVERRIDE",
                "FOWNER",
                "SETGID",
                "SETUID",
                "NET_BIND_SERVICE"
            ]
        );
        assert!(!policy.add.contains(&"KILL".to_string()));
    }

    #[test]
    fn every_capability_is_retained_by_dev_environment() {
        for cap in DEV_ENVIRONMENT {
            match cap {
                Capability::Chown
                | Capability::DacOverride
                | Capability::Fowner
                | Capability::Setgid
                | Capability::Setuid
                | Capability::NetBindService => {}
            }
        }
        assert_eq!(DEV_ENVIRONMENT.len(), 6);
    }
}
