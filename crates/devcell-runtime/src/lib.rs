//! Container lifecycle management for devcell.
//!
//! Ties the container runtime, the state store, and the disk image manager
//! together: one long-lived development container per user, with loop-mounted
//! storage quotas, an SSH port from a fixed range, and periodic
//! reconciliation of stored status against the runtime.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod audit;
pub mod backend;
pub mod exec;
pub mod lifecycle;
pub mod locks;
pub mod metrics;
pub mod ports;
pub mod state;
