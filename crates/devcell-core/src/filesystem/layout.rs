//! Deterministic host paths for per-user storage.

use std::path::{Path, PathBuf};

use devcell_common::config::StorageConfig;
use devcell_common::types::StorageTier;

/// Image file and mount point of one storage tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    /// Sparse image file.
    pub image: PathBuf,
    /// Host directory the image is mounted on.
    pub mount_point: PathBuf,
}

impl StoragePaths {
    /// Creates a pair from explicit paths.
    pub fn new(image: impl Into<PathBuf>, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            mount_point: mount_point.into(),
        }
    }

    /// Directory holding a copy of the mount point content while it is
    /// migrated into a fresh image.
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        sibling(&self.mount_point, "migrate-tmp")
    }

    /// Name the staging directory is renamed to once the restore finished.
    #[must_use]
    pub fn completed_dir(&self) -> PathBuf {
        sibling(&self.mount_point, "migrate-done")
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Host storage roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    ssd_root: PathBuf,
    hdd_root: PathBuf,
    shared_root: PathBuf,
}

impl StorageLayout {
    /// Creates a layout from explicit roots.
    pub fn new(
        ssd_root: impl Into<PathBuf>,
        hdd_root: impl Into<PathBuf>,
        shared_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ssd_root: ssd_root.into(),
            hdd_root: hdd_root.into(),
            shared_root: shared_root.into(),
        }
    }

    /// Creates a layout from the storage configuration.
    #[must_use]
    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.ssd_root, &config.hdd_root, &config.shared_root)
    }

    /// Paths of `username`'s image on `tier`.
    ///
    /// The username must already be validated; it is used verbatim as a
    /// path component.
    #[must_use]
    pub fn paths(&self, username: &str, tier: StorageTier) -> StoragePaths {
        let (root, name) = match tier {
            StorageTier::Fast => (&self.ssd_root, "workspace"),
            StorageTier::Capacity => (&self.hdd_root, "storage"),
        };
        let user_dir = root.join(username);
        StoragePaths {
            image: user_dir.join(format!("{name}.img")),
            mount_point: user_dir.join(name),
        }
    }

    /// Root directory holding every user's images on `tier`.
    #[must_use]
    pub fn root(&self, tier: StorageTier) -> &Path {
        match tier {
            StorageTier::Fast => &self.ssd_root,
            StorageTier::Capacity => &self.hdd_root,
        }
    }

    /// Directory shared read-only with every container.
    #[must_use]
    pub fn shared_root(&self) -> &Path {
        &self.shared_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_host_convention() {
        let layout = StorageLayout::from_config(&StorageConfig::default());
        let fast = layout.paths("alice", StorageTier::Fast);
        assert_eq!(
            fast.image,
            PathBuf::from("/data/ssd/containers/alice/workspace.img")
        );
        assert_eq!(
            fast.mount_point,
            PathBuf::from("/data/ssd/containers/alice/workspace")
        );
        let capacity = layout.paths("alice", StorageTier::Capacity);
        assert_eq!(
            capacity.image,
            PathBuf::from("/data/hdd/containers/alice/storage.img")
        );
        assert_eq!(layout.shared_root(), Path::new("/data/hdd/shared"));
        assert!(capacity.image.starts_with(layout.root(StorageTier::Capacity)));
    }

    #[test]
    fn staging_dirs_sit_next_to_mount_point() {
        let paths = StoragePaths::new("/x/a.img", "/x/a");
        assert_eq!(paths.staging_dir(), PathBuf::from("/x/a.migrate-tmp"));
        assert_eq!(paths.completed_dir(), PathBuf::from("/x/a.migrate-done"));
    }
}
