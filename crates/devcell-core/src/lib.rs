//! # devcell-core
//!
//! Host-level primitives for the devcell orchestrator.
//!
//! This crate provides safe abstractions over:
//! - **Host commands**: privileged subprocesses built from argument
//!   vectors, each with a timeout and captured output.
//! - **Filesystem**: per-user storage layout, mount-table queries, and the
//!   loop-mounted disk image manager that backs storage quotas.
//! - **Capabilities**: the least-privilege capability set of a
//!   development container.
//! - **Cgroup limits**: CPU, memory, and process limits derived from a
//!   resource allocation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod filesystem;
pub mod host;
pub mod limits;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
