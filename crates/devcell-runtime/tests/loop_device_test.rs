//! Disk image tests against real loop devices.
//!
//! These need root plus `mkfs.ext4`, `losetup`, and `resize2fs`, so they
//! are ignored by default:
//!
//! ```text
//! sudo -E cargo test -p devcell-runtime --test loop_device_test -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use devcell_common::types::StorageTier;
use devcell_core::filesystem::image::{DiskImageManager, ResizeOutcome};
use devcell_core::filesystem::layout::StorageLayout;
use devcell_core::host::{HostRunner, PrivilegedRunner};

const GIB: u64 = devcell_common::constants::GIB;

fn manager() -> DiskImageManager {
    let runner: Arc<dyn HostRunner> = Arc::new(PrivilegedRunner::new(false, Duration::from_secs(120)));
    DiskImageManager::new(runner, 0, 0)
}

#[tokio::test]
#[ignore = "requires root and loop devices"]
async fn real_image_survives_shrink_and_grow() {
    let dir = tempfile::tempdir().unwrap();
    let layout = StorageLayout::new(dir.path().join("ssd"), dir.path().join("hdd"), dir.path());
    let paths = layout.paths("looptest", StorageTier::Fast);
    let disks = manager();

    disks.create_and_mount(&paths, 2).await.unwrap();
    let usage = disks.usage(&paths.mount_point).await.unwrap();
    assert!(usage.total_bytes > GIB && usage.total_bytes <= 2 * GIB);

    tokio::fs::write(paths.mount_point.join("kept.txt"), "survives")
        .await
        .unwrap();

    assert_eq!(
        disks.resize(&paths, 1).await.unwrap(),
        ResizeOutcome::Shrunk { from: 2, to: 1 }
    );
    assert_eq!(
        disks.resize(&paths, 1).await.unwrap(),
        ResizeOutcome::Unchanged
    );
    assert_eq!(
        disks.resize(&paths, 2).await.unwrap(),
        ResizeOutcome::Grown { from: 1, to: 2 }
    );
    assert_eq!(
        tokio::fs::read_to_string(paths.mount_point.join("kept.txt"))
            .await
            .unwrap(),
        "survives"
    );

    disks.unmount(&paths.mount_point).await.unwrap();
    disks.ensure_mounted(&paths).await.unwrap();
    assert!(paths.mount_point.join("kept.txt").exists());

    disks.remove(&paths).await.unwrap();
    assert!(!paths.image.exists());
}
