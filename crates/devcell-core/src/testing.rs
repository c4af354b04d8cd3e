//! In-process simulated host for tests.
//!
//! [`SimulatedHost`] implements [`HostRunner`] by interpreting the host
//! tools the disk image manager invokes. Files and directories are real
//! (tests point it at a temporary directory). Mounts, loop devices, and
//! filesystem sizes live in memory. A mount does not hide the directory
//! underneath; content written to a mount point stays visible.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use devcell_common::error::Result;

use crate::host::{CommandOutput, HostCommand, HostRunner};

const GIB: u64 = devcell_common::constants::GIB;

#[derive(Debug, Default)]
struct SimState {
    /// Mount point to backing image.
    mounts: HashMap<PathBuf, PathBuf>,
    /// Image to attached loop device.
    attached: HashMap<PathBuf, String>,
    /// Images still referenced by a container after a host unmount.
    held: HashSet<PathBuf>,
    /// Image to filesystem size in bytes.
    filesystems: HashMap<PathBuf, u64>,
    /// Image to used bytes.
    used: HashMap<PathBuf, u64>,
    /// Program to countdown of invocations until an injected failure.
    failures: HashMap<String, usize>,
    history: Vec<String>,
    next_loop: u32,
}

/// A fake host that interprets disk tool invocations.
#[derive(Debug, Default)]
pub struct SimulatedHost {
    state: Mutex<SimState>,
}

impl SimulatedHost {
    /// Creates an empty host with nothing mounted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every command line run so far.
    pub fn commands(&self) -> Vec<String> {
        self.lock().history.clone()
    }

    /// Program names of every command run so far.
    pub fn programs(&self) -> Vec<String> {
        self.lock()
            .history
            .iter()
            .filter_map(|c| c.split_whitespace().next())
            .map(str::to_string)
            .collect()
    }

    /// Forgets the command history.
    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    /// Makes the `nth` (1-based) next invocation of `program` exit with 1.
    pub fn fail_next(&self, program: &str, nth: usize) {
        let _ = self.lock().failures.insert(program.to_string(), nth.max(1));
    }

    /// Whether something is mounted at `mount_point`.
    pub fn is_mounted(&self, mount_point: &Path) -> bool {
        self.lock().mounts.contains_key(mount_point)
    }

    /// Size of the filesystem inside `image`, if formatted.
    pub fn filesystem_size(&self, image: &Path) -> Option<u64> {
        self.lock().filesystems.get(image).copied()
    }

    /// Sets how many bytes the filesystem in `image` reports as used.
    pub fn set_used_bytes(&self, image: &Path, bytes: u64) {
        let _ = self.lock().used.insert(image.to_path_buf(), bytes);
    }

    /// Keeps the loop device of `image` attached after a host unmount, as a
    /// running container holding the filesystem would.
    pub fn hold(&self, image: &Path) {
        let _ = self.lock().held.insert(image.to_path_buf());
    }

    /// Releases an image held by [`SimulatedHost::hold`].
    pub fn release(&self, image: &Path) {
        let mut state = self.lock();
        let _ = state.held.remove(image);
        if !state.mounts.values().any(|i| i == image) {
            let _ = state.attached.remove(image);
        }
    }

    /// Drops every mount and loop device, as a host reboot would.
    pub fn unmount_all(&self) {
        let mut state = self.lock();
        state.mounts.clear();
        state.attached.clear();
        state.held.clear();
    }

    fn interpret(state: &mut SimState, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let positional: Vec<&str> = args
            .iter()
            .map(String::as_str)
            .filter(|a| !a.starts_with('-'))
            .collect();
        let output = match program {
            "mkdir" => {
                for dir in positional {
                    std::fs::create_dir_all(dir)?;
                }
                CommandOutput::ok()
            }
            "truncate" => {
                let size = args.get(1).and_then(|s| parse_gib(s));
                let (Some(size), Some(path)) = (size, args.get(2)) else {
                    return Ok(usage_error());
                };
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(path)?;
                file.set_len(size)?;
                CommandOutput::ok()
            }
            "mkfs.ext4" => {
                let Some(image) = positional.last().map(PathBuf::from) else {
                    return Ok(usage_error());
                };
                let size = std::fs::metadata(&image)?.len();
                let _ = state.filesystems.insert(image.clone(), size);
                let _ = state.used.insert(image, 0);
                CommandOutput::ok()
            }
            "mount" => Self::mount(state, &positional),
            "umount" => {
                let Some(mount_point) = positional.first().map(PathBuf::from) else {
                    return Ok(usage_error());
                };
                let Some(image) = state.mounts.remove(&mount_point) else {
                    return Ok(CommandOutput::failed(32, "not mounted"));
                };
                let still_used = state.held.contains(&image)
                    || state.mounts.values().any(|i| *i == image);
                if !still_used {
                    let _ = state.attached.remove(&image);
                }
                CommandOutput::ok()
            }
            "findmnt" => {
                let mount_point = positional.iter().rev().find(|a| a.starts_with('/'));
                match mount_point
                    .map(PathBuf::from)
                    .and_then(|mp| state.mounts.get(&mp).cloned())
                {
                    Some(image) => {
                        let device = state.attached.get(&image).cloned().unwrap_or_default();
                        CommandOutput::with_stdout(format!("{device}\n"))
                    }
                    None => CommandOutput::failed(1, ""),
                }
            }
            "losetup" => match args.first().map(String::as_str) {
                Some("-j") => {
                    let image = args.get(1).map(PathBuf::from).unwrap_or_default();
                    state.attached.get(&image).map_or_else(CommandOutput::ok, |device| {
                        CommandOutput::with_stdout(format!(
                            "{device}: []: ({})\n",
                            image.display()
                        ))
                    })
                }
                Some("-c") => CommandOutput::ok(),
                _ => usage_error(),
            },
            "resize2fs" => {
                let Some(target) = positional.first() else {
                    return Ok(usage_error());
                };
                let image = state
                    .attached
                    .iter()
                    .find(|(_, device)| device.as_str() == *target)
                    .map_or_else(|| PathBuf::from(target), |(image, _)| image.clone());
                if !state.filesystems.contains_key(&image) {
                    return Ok(CommandOutput::failed(1, "bad magic number in super-block"));
                }
                let size = match positional.get(1) {
                    Some(size) => match parse_gib(size) {
                        Some(size) => size,
                        None => return Ok(usage_error()),
                    },
                    None => std::fs::metadata(&image)?.len(),
                };
                if state.used.get(&image).copied().unwrap_or(0) > size {
                    return Ok(CommandOutput::failed(1, "No space left on device"));
                }
                let _ = state.filesystems.insert(image, size);
                CommandOutput::ok()
            }
            "e2fsck" | "chown" => CommandOutput::ok(),
            "stat" => {
                let Some(path) = positional.last() else {
                    return Ok(usage_error());
                };
                let size = std::fs::metadata(path)?.len();
                CommandOutput::with_stdout(format!("{size}\n"))
            }
            "df" => {
                let Some(image) = positional
                    .last()
                    .and_then(|mp| state.mounts.get(Path::new(mp)))
                else {
                    return Ok(CommandOutput::failed(1, "no such mount"));
                };
                let total = state.filesystems.get(image).copied().unwrap_or(0);
                let used = state.used.get(image).copied().unwrap_or(0);
                CommandOutput::with_stdout(format!("1B-blocks Used\n{total} {used}\n"))
            }
            "cp" => {
                let (Some(from), Some(to)) = (positional.first(), positional.get(1)) else {
                    return Ok(usage_error());
                };
                let from = from.strip_suffix("/.").unwrap_or(from);
                copy_tree(Path::new(from), Path::new(to))?;
                CommandOutput::ok()
            }
            "mv" => {
                let (Some(from), Some(to)) = (positional.first(), positional.get(1)) else {
                    return Ok(usage_error());
                };
                std::fs::rename(from, to)?;
                CommandOutput::ok()
            }
            "rm" => {
                for path in positional {
                    let path = Path::new(path);
                    let result = if path.is_dir() {
                        std::fs::remove_dir_all(path)
                    } else {
                        std::fs::remove_file(path)
                    };
                    match result {
                        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                        _ => {}
                    }
                }
                CommandOutput::ok()
            }
            _ => CommandOutput::failed(127, "command not found"),
        };
        Ok(output)
    }

    fn mount(state: &mut SimState, positional: &[&str]) -> CommandOutput {
        let paths: Vec<&str> = positional
            .iter()
            .copied()
            .filter(|a| a.starts_with('/'))
            .collect();
        let (Some(source), Some(mount_point)) = (paths.first(), paths.get(1)) else {
            return usage_error();
        };
        let mount_point = PathBuf::from(mount_point);
        if state.mounts.contains_key(&mount_point) {
            return CommandOutput::failed(32, "already mounted");
        }
        let image = state
            .attached
            .iter()
            .find(|(_, device)| device.as_str() == *source)
            .map_or_else(|| PathBuf::from(source), |(image, _)| image.clone());
        if !state.filesystems.contains_key(&image) {
            return CommandOutput::failed(32, "wrong fs type, bad superblock");
        }
        if !state.attached.contains_key(&image) {
            let device = format!("/dev/loop{}", state.next_loop);
            state.next_loop += 1;
            let _ = state.attached.insert(image.clone(), device);
        }
        let _ = state.mounts.insert(mount_point, image);
        CommandOutput::ok()
    }
}

#[async_trait]
impl HostRunner for SimulatedHost {
    async fn execute(&self, command: &HostCommand) -> Result<CommandOutput> {
        let args: Vec<String> = command
            .arguments()
            .iter()
            .map(OsString::as_os_str)
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let mut state = self.lock();
        state.history.push(command.to_string());

        let program = command.program();
        if let Some(remaining) = state.failures.get_mut(program) {
            *remaining -= 1;
            if *remaining == 0 {
                let _ = state.failures.remove(program);
                return Ok(CommandOutput::failed(1, "injected failure"));
            }
        }

        Ok(Self::interpret(&mut state, program, &args)
            .unwrap_or_else(|e| CommandOutput::failed(1, e.to_string())))
    }
}

fn usage_error() -> CommandOutput {
    CommandOutput::failed(2, "usage")
}

fn parse_gib(size: &str) -> Option<u64> {
    size.strip_suffix('G')?.parse::<u64>().ok().map(|n| n * GIB)
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            let _ = std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mount_requires_formatted_image() {
        let dir = tempfile::tempdir().unwrap();
        let host = SimulatedHost::new();
        let image = dir.path().join("x.img");
        let mp = dir.path().join("x");
        let mount = HostCommand::new("mount", "mount image")
            .args(["-o", "loop"])
            .arg(&image)
            .arg(&mp);
        assert!(host.run(&mount).await.is_err());

        let _ = host
            .run(&HostCommand::new("truncate", "t").args(["-s", "1G"]).arg(&image))
            .await
            .unwrap();
        let _ = host
            .run(&HostCommand::new("mkfs.ext4", "f").arg(&image))
            .await
            .unwrap();
        let _ = host.run(&mount).await.unwrap();
        assert!(host.is_mounted(&mp));
    }

    #[tokio::test]
    async fn injected_failure_hits_requested_invocation() {
        let host = SimulatedHost::new();
        host.fail_next("chown", 2);
        let chown = HostCommand::new("chown", "c").args(["1000:1000", "/tmp"]);
        assert!(host.run(&chown).await.is_ok());
        assert!(host.run(&chown).await.is_err());
        assert!(host.run(&chown).await.is_ok());
    }
}
