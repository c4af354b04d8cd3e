//! Per-user storage on loop-mounted ext4 images.
//!
//! Each user owns up to two images (fast and capacity tier). An image is a
//! sparse file formatted as ext4 and mounted through a loop device, so its
//! size is a hard quota that survives container rebuilds.

pub mod image;
pub mod layout;
pub mod mount;
