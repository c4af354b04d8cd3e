//! Mount-table and loop-device queries.
//!
//! All queries go through the [`HostRunner`] so they observe the same
//! namespace the mounts were made in.

use std::path::Path;

use devcell_common::error::{DevcellError, Result};

use crate::host::{HostCommand, HostRunner};

/// Returns the source device mounted exactly at `mount_point`, if any.
///
/// # Errors
///
/// Returns an error if `findmnt` fails for a reason other than "not found".
pub async fn mount_source(runner: &dyn HostRunner, mount_point: &Path) -> Result<Option<String>> {
    let cmd = HostCommand::new("findmnt", "query mount table")
        .args(["-n", "-o", "SOURCE", "--mountpoint"])
        .arg(mount_point);
    let output = runner.execute(&cmd).await?;
    match output.code {
        Some(0) => {
            let source = output.stdout.trim();
            Ok((!source.is_empty()).then(|| source.to_string()))
        }
        Some(1) => Ok(None),
        _ => {
            tracing::warn!(
                mount_point = %mount_point.display(),
                code = ?output.code,
                stderr = %output.stderr.trim(),
                "findmnt failed"
            );
            Err(DevcellError::DiskOp {
                step: cmd.step(),
                status: output.status_summary(),
            })
        }
    }
}

/// Whether something is mounted at `mount_point`.
///
/// # Errors
///
/// See [`mount_source`].
pub async fn is_mounted(runner: &dyn HostRunner, mount_point: &Path) -> Result<bool> {
    Ok(mount_source(runner, mount_point).await?.is_some())
}

/// Returns the loop device currently backed by `image`, if any.
///
/// # Errors
///
/// Returns an error if `losetup -j` fails.
pub async fn loop_device_for(runner: &dyn HostRunner, image: &Path) -> Result<Option<String>> {
    let cmd = HostCommand::new("losetup", "query loop devices")
        .arg("-j")
        .arg(image);
    let output = runner.run(&cmd).await?;
    Ok(parse_losetup(&output.stdout))
}

/// Parses the first device of `losetup -j` output
/// (`/dev/loop3: []: (/path/to/image)`).
fn parse_losetup(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(device, _)| device.trim())
        .find(|device| !device.is_empty())
        .map(str::to_string)
}

/// Mounts `image` on `mount_point`.
///
/// When a loop device already backs the image (for example because a
/// container still holds a lazily unmounted filesystem), that device is
/// mounted instead of attaching a second one to the same file.
///
/// # Errors
///
/// Returns [`DevcellError::DiskOp`] if `mount` fails.
pub async fn mount_image(runner: &dyn HostRunner, image: &Path, mount_point: &Path) -> Result<()> {
    let cmd = match loop_device_for(runner, image).await? {
        Some(device) => HostCommand::new("mount", "mount image")
            .arg(device)
            .arg(mount_point),
        None => HostCommand::new("mount", "mount image")
            .args(["-o", "loop"])
            .arg(image)
            .arg(mount_point),
    };
    let _ = runner.run(&cmd).await?;
    tracing::info!(
        image = %image.display(),
        mount_point = %mount_point.display(),
        "image mounted"
    );
    Ok(())
}

/// Lazily unmounts `mount_point`.
///
/// # Errors
///
/// Returns [`DevcellError::DiskOp`] if `umount` fails.
pub async fn lazy_unmount(runner: &dyn HostRunner, mount_point: &Path) -> Result<()> {
    let cmd = HostCommand::new("umount", "unmount image")
        .arg("-l")
        .arg(mount_point);
    let _ = runner.run(&cmd).await?;
    tracing::info!(mount_point = %mount_point.display(), "image unmounted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_losetup_association() {
        let out = "/dev/loop7: []: (/data/ssd/containers/alice/workspace.img)\n";
        assert_eq!(parse_losetup(out).as_deref(), Some("/dev/loop7"));
        assert_eq!(parse_losetup(""), None);
    }
}
