//! Loop-mounted disk image management.
//!
//! A storage quota is an ext4 filesystem inside a sparse file, mounted on
//! the host through a loop device and bind-mounted into the container. The
//! manager creates, mounts, resizes, and removes those images. Every step is
//! a host tool run through a [`HostRunner`].
//!
//! # Migration
//!
//! When an image is created on a mount point that already holds files, the
//! content is copied to `<mount_point>.migrate-tmp`, the fresh image is
//! mounted over the directory, and the copy is restored into it. The
//! staging directory exists exactly while a restore is outstanding, so a
//! later call that finds it completes the migration.

use std::path::Path;
use std::sync::Arc;

use devcell_common::constants::GIB;
use devcell_common::error::{DevcellError, Result};

use crate::filesystem::layout::StoragePaths;
use crate::filesystem::mount;
use crate::host::{CommandOutput, HostCommand, HostRunner};

/// `e2fsck` exit codes meaning "clean" or "errors corrected".
const FSCK_OK: &[i32] = &[0, 1, 2];

/// Filesystem usage of a mounted image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    /// Filesystem size in bytes.
    pub total_bytes: u64,
    /// Bytes in use.
    pub used_bytes: u64,
}

impl DiskUsage {
    /// Used space in GiB.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn used_gb(&self) -> f64 {
        self.used_bytes as f64 / GIB as f64
    }
}

/// Usage of the host filesystem holding `path`.
///
/// A path that does not exist yet is measured at its nearest existing
/// ancestor.
///
/// # Errors
///
/// Returns [`DevcellError::Io`] if `statvfs` fails.
#[allow(clippy::useless_conversion)]
pub fn filesystem_usage(path: &Path) -> Result<DiskUsage> {
    let target = path.ancestors().find(|p| p.exists()).unwrap_or(path);
    let stat = nix::sys::statvfs::statvfs(target).map_err(|errno| DevcellError::Io {
        path: target.to_path_buf(),
        source: errno.into(),
    })?;
    let fragment = u64::from(stat.fragment_size());
    let blocks = u64::from(stat.blocks());
    let free = u64::from(stat.blocks_free());
    Ok(DiskUsage {
        total_bytes: blocks.saturating_mul(fragment),
        used_bytes: blocks.saturating_sub(free).saturating_mul(fragment),
    })
}

/// Result of [`DiskImageManager::resize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// No image exists; nothing was done.
    Missing,
    /// The image already has the requested size.
    Unchanged,
    /// The image and its filesystem were enlarged.
    Grown {
        /// Previous size in GiB.
        from: u32,
        /// New size in GiB.
        to: u32,
    },
    /// The filesystem and its image were reduced.
    Shrunk {
        /// Previous size in GiB.
        from: u32,
        /// New size in GiB.
        to: u32,
    },
    /// A zero quota removed the image.
    Removed,
}

/// Creates, mounts, resizes, and removes per-user disk images.
#[derive(Clone)]
pub struct DiskImageManager {
    runner: Arc<dyn HostRunner>,
    uid: u32,
    gid: u32,
}

impl std::fmt::Debug for DiskImageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImageManager")
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .finish_non_exhaustive()
    }
}

impl DiskImageManager {
    /// Creates a manager that hands mount roots to `uid:gid`.
    pub fn new(runner: Arc<dyn HostRunner>, uid: u32, gid: u32) -> Self {
        Self { runner, uid, gid }
    }

    /// Creates the image if needed and mounts it on the mount point.
    ///
    /// A zero size is a no-op. Existing mount point content is migrated
    /// into a new image, and an interrupted migration is completed first.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::DiskOp`] if a host tool fails,
    /// [`DevcellError::Timeout`] if one exceeds its budget, or
    /// [`DevcellError::Io`] if the mount point cannot be inspected.
    pub async fn create_and_mount(&self, paths: &StoragePaths, size_gb: u32) -> Result<()> {
        if size_gb == 0 {
            tracing::debug!(image = %paths.image.display(), "zero quota, no image");
            return Ok(());
        }
        let mut mkdir = HostCommand::new("mkdir", "create directories").arg("-p");
        if let Some(parent) = paths.image.parent() {
            mkdir = mkdir.arg(parent);
        }
        let _ = self.run(mkdir.arg(&paths.mount_point)).await?;

        let completed = paths.completed_dir();
        if exists(&completed).await? {
            self.remove_tree(&completed).await?;
        }

        if exists(&paths.staging_dir()).await? {
            tracing::warn!(
                mount_point = %paths.mount_point.display(),
                "found unfinished migration, completing it"
            );
            self.recover_migration(paths, size_gb).await?;
        } else if !exists(&paths.image).await? {
            let migrate = has_entries(&paths.mount_point).await?;
            if migrate {
                tracing::info!(
                    mount_point = %paths.mount_point.display(),
                    "staging existing content before creating image"
                );
                let staging = paths.staging_dir();
                let _ = self
                    .run(
                        HostCommand::new("mkdir", "create staging directory")
                            .arg("-p")
                            .arg(&staging),
                    )
                    .await?;
                let _ = self
                    .run(copy_contents(&paths.mount_point, &staging, "stage content"))
                    .await?;
            }
            self.format(&paths.image, size_gb).await?;
            if !self.is_mounted(&paths.mount_point).await? {
                mount::mount_image(self.runner.as_ref(), &paths.image, &paths.mount_point).await?;
            }
            if migrate {
                self.finish_migration(paths).await?;
            }
            tracing::info!(image = %paths.image.display(), size_gb, "image created");
        } else if !self.is_mounted(&paths.mount_point).await? {
            mount::mount_image(self.runner.as_ref(), &paths.image, &paths.mount_point).await?;
        }

        self.chown_root(&paths.mount_point).await
    }

    /// Mounts an existing image if it is not mounted yet.
    ///
    /// Does nothing when the image does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if `mkdir` or `mount` fails.
    pub async fn ensure_mounted(&self, paths: &StoragePaths) -> Result<()> {
        if !exists(&paths.image).await? {
            return Ok(());
        }
        if exists(&paths.staging_dir()).await? {
            let size_gb = self.size_gb(&paths.image).await?;
            tracing::warn!(
                mount_point = %paths.mount_point.display(),
                size_gb,
                "found unfinished migration, completing it"
            );
            return self.create_and_mount(paths, size_gb.max(1)).await;
        }
        let _ = self
            .run(
                HostCommand::new("mkdir", "create mount point")
                    .arg("-p")
                    .arg(&paths.mount_point),
            )
            .await?;
        if !self.is_mounted(&paths.mount_point).await? {
            mount::mount_image(self.runner.as_ref(), &paths.image, &paths.mount_point).await?;
        }
        Ok(())
    }

    /// Lazily unmounts the mount point if something is mounted there.
    ///
    /// # Errors
    ///
    /// Returns an error if `umount` fails.
    pub async fn unmount(&self, mount_point: &Path) -> Result<()> {
        if self.is_mounted(mount_point).await? {
            mount::lazy_unmount(self.runner.as_ref(), mount_point).await?;
        }
        Ok(())
    }

    /// Applies a new size to an existing image.
    ///
    /// Growing works online through the loop device. Shrinking needs the
    /// filesystem offline: it is refused when the data does not fit or when
    /// the image is still attached after the host unmount.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::Quota`] when a shrink is refused,
    /// [`DevcellError::DiskOp`] when a host tool fails.
    pub async fn resize(&self, paths: &StoragePaths, new_size_gb: u32) -> Result<ResizeOutcome> {
        if !exists(&paths.image).await? {
            tracing::warn!(image = %paths.image.display(), "resize requested for missing image");
            return Ok(ResizeOutcome::Missing);
        }
        if new_size_gb == 0 {
            self.remove(paths).await?;
            return Ok(ResizeOutcome::Removed);
        }
        let current = self.size_gb(&paths.image).await?;
        if current == new_size_gb {
            tracing::debug!(image = %paths.image.display(), size_gb = current, "size unchanged");
            return Ok(ResizeOutcome::Unchanged);
        }
        let mounted = self.is_mounted(&paths.mount_point).await?;
        if new_size_gb > current {
            self.grow(paths, new_size_gb, mounted).await?;
            tracing::info!(image = %paths.image.display(), from = current, to = new_size_gb, "image grown");
            Ok(ResizeOutcome::Grown {
                from: current,
                to: new_size_gb,
            })
        } else {
            self.shrink(paths, new_size_gb, mounted).await?;
            tracing::info!(image = %paths.image.display(), from = current, to = new_size_gb, "image shrunk");
            Ok(ResizeOutcome::Shrunk {
                from: current,
                to: new_size_gb,
            })
        }
    }

    /// Unmounts and deletes the image.
    ///
    /// # Errors
    ///
    /// Returns an error if `umount` or `rm` fails.
    pub async fn remove(&self, paths: &StoragePaths) -> Result<()> {
        self.unmount(&paths.mount_point).await?;
        if exists(&paths.image).await? {
            let _ = self
                .run(HostCommand::new("rm", "delete image").arg("-f").arg(&paths.image))
                .await?;
            tracing::info!(image = %paths.image.display(), "image deleted");
        }
        Ok(())
    }

    /// Filesystem usage at the mount point, zeros when nothing is mounted.
    ///
    /// # Errors
    ///
    /// Returns an error if `df` fails or prints something unexpected.
    pub async fn usage(&self, mount_point: &Path) -> Result<DiskUsage> {
        if !self.is_mounted(mount_point).await? {
            return Ok(DiskUsage::default());
        }
        let cmd = HostCommand::new("df", "read filesystem usage")
            .args(["-B1", "--output=size,used"])
            .arg(mount_point);
        let output = self.run(cmd).await?;
        parse_df(&output.stdout).ok_or_else(|| DevcellError::DiskOp {
            step: "read filesystem usage",
            status: "unexpected df output".into(),
        })
    }

    /// Whether the image file exists.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::Io`] if existence cannot be determined.
    pub async fn image_exists(&self, paths: &StoragePaths) -> Result<bool> {
        exists(&paths.image).await
    }

    /// Current image size in GiB, rounded to the nearest whole GiB.
    ///
    /// # Errors
    ///
    /// Returns an error if `stat` fails or prints something unexpected.
    pub async fn size_gb(&self, image: &Path) -> Result<u32> {
        let cmd = HostCommand::new("stat", "read image size")
            .args(["-c", "%s"])
            .arg(image);
        let output = self.run(cmd).await?;
        let bytes: u64 = output
            .stdout
            .trim()
            .parse()
            .map_err(|_| DevcellError::DiskOp {
                step: "read image size",
                status: "unexpected stat output".into(),
            })?;
        Ok(u32::try_from(bytes.saturating_add(GIB / 2) / GIB).unwrap_or(u32::MAX))
    }

    async fn grow(&self, paths: &StoragePaths, size_gb: u32, mounted: bool) -> Result<()> {
        let device = if mounted {
            let device = mount::loop_device_for(self.runner.as_ref(), &paths.image)
                .await?
                .ok_or_else(|| DevcellError::DiskOp {
                    step: "locate loop device",
                    status: "mounted image has no loop device".into(),
                })?;
            Some(device)
        } else {
            None
        };
        let _ = self.run(truncate(&paths.image, size_gb, "grow image")).await?;
        match device {
            Some(device) => {
                let _ = self
                    .run(
                        HostCommand::new("losetup", "refresh loop device")
                            .arg("-c")
                            .arg(&device),
                    )
                    .await?;
                let _ = self
                    .run(HostCommand::new("resize2fs", "grow filesystem").arg(&device))
                    .await?;
            }
            None => {
                let _ = self.run(fsck(&paths.image)).await?;
                let _ = self
                    .run(HostCommand::new("resize2fs", "grow filesystem").arg(&paths.image))
                    .await?;
            }
        }
        Ok(())
    }

    async fn shrink(&self, paths: &StoragePaths, size_gb: u32, mounted: bool) -> Result<()> {
        let target_bytes = u64::from(size_gb) * GIB;
        if mounted {
            let usage = self.usage(&paths.mount_point).await?;
            if usage.used_bytes > target_bytes {
                return Err(DevcellError::Quota {
                    message: format!(
                        "{:.1} GiB in use does not fit in {size_gb} GiB",
                        usage.used_gb()
                    ),
                });
            }
            mount::lazy_unmount(self.runner.as_ref(), &paths.mount_point).await?;
        }

        if let Some(device) = mount::loop_device_for(self.runner.as_ref(), &paths.image).await? {
            tracing::warn!(
                image = %paths.image.display(),
                device = %device,
                "image still attached after unmount, refusing to shrink"
            );
            if mounted {
                mount::mount_image(self.runner.as_ref(), &paths.image, &paths.mount_point).await?;
            }
            return Err(DevcellError::Quota {
                message: "image is in use elsewhere; stop the container before shrinking".into(),
            });
        }

        let _ = self.run(fsck(&paths.image)).await?;
        let shrink = HostCommand::new("resize2fs", "shrink filesystem")
            .arg(&paths.image)
            .arg(format!("{size_gb}G"));
        if let Err(e) = self.run(shrink).await {
            if mounted {
                if let Err(remount) =
                    mount::mount_image(self.runner.as_ref(), &paths.image, &paths.mount_point).await
                {
                    tracing::error!(
                        image = %paths.image.display(),
                        error = %remount,
                        "remount after failed shrink also failed"
                    );
                }
            }
            return Err(e);
        }
        let _ = self.run(truncate(&paths.image, size_gb, "shrink image")).await?;
        if mounted {
            mount::mount_image(self.runner.as_ref(), &paths.image, &paths.mount_point).await?;
        }
        Ok(())
    }

    async fn recover_migration(&self, paths: &StoragePaths, size_gb: u32) -> Result<()> {
        if !self.is_mounted(&paths.mount_point).await? {
            self.format(&paths.image, size_gb).await?;
            mount::mount_image(self.runner.as_ref(), &paths.image, &paths.mount_point).await?;
        }
        self.finish_migration(paths).await
    }

    async fn finish_migration(&self, paths: &StoragePaths) -> Result<()> {
        let staging = paths.staging_dir();
        let completed = paths.completed_dir();
        let _ = self
            .run(copy_contents(&staging, &paths.mount_point, "restore content"))
            .await?;
        let _ = self
            .run(
                HostCommand::new("mv", "finish migration")
                    .arg(&staging)
                    .arg(&completed),
            )
            .await?;
        self.remove_tree(&completed).await?;
        tracing::info!(mount_point = %paths.mount_point.display(), "migration finished");
        Ok(())
    }

    async fn format(&self, image: &Path, size_gb: u32) -> Result<()> {
        let _ = self.run(truncate(image, size_gb, "allocate image")).await?;
        let _ = self
            .run(
                HostCommand::new("mkfs.ext4", "format image")
                    .args(["-q", "-m", "0", "-F"])
                    .arg(image),
            )
            .await?;
        Ok(())
    }

    async fn chown_root(&self, mount_point: &Path) -> Result<()> {
        let _ = self
            .run(
                HostCommand::new("chown", "set mount owner")
                    .arg(format!("{}:{}", self.uid, self.gid))
                    .arg(mount_point),
            )
            .await?;
        Ok(())
    }

    async fn remove_tree(&self, path: &Path) -> Result<()> {
        let _ = self
            .run(HostCommand::new("rm", "remove directory").arg("-rf").arg(path))
            .await?;
        Ok(())
    }

    async fn is_mounted(&self, mount_point: &Path) -> Result<bool> {
        mount::is_mounted(self.runner.as_ref(), mount_point).await
    }

    async fn run(&self, command: HostCommand) -> Result<CommandOutput> {
        self.runner.run(&command).await
    }
}

fn truncate(image: &Path, size_gb: u32, step: &'static str) -> HostCommand {
    HostCommand::new("truncate", step)
        .arg("-s")
        .arg(format!("{size_gb}G"))
        .arg(image)
}

fn fsck(image: &Path) -> HostCommand {
    HostCommand::new("e2fsck", "check filesystem")
        .args(["-f", "-y"])
        .arg(image)
        .accept_exit_codes(FSCK_OK)
}

fn copy_contents(from: &Path, to: &Path, step: &'static str) -> HostCommand {
    HostCommand::new("cp", step)
        .arg("-a")
        .arg(from.join("."))
        .arg(to)
}

async fn exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| DevcellError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

async fn has_entries(dir: &Path) -> Result<bool> {
    let io_err = |e| DevcellError::Io {
        path: dir.to_path_buf(),
        source: e,
    };
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(io_err(e)),
    };
    Ok(entries.next_entry().await.map_err(io_err)?.is_some())
}

/// Parses `df -B1 --output=size,used` output.
fn parse_df(stdout: &str) -> Option<DiskUsage> {
    let line = stdout.lines().nth(1)?;
    let mut fields = line.split_whitespace();
    let total_bytes = fields.next()?.parse().ok()?;
    let used_bytes = fields.next()?.parse().ok()?;
    Some(DiskUsage {
        total_bytes,
        used_bytes,
    })
}
