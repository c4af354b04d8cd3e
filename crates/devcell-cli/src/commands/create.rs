//! `devcellctl create` - Provision storage and create a user's container.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Args;
use devcell_common::types::{ResourceRequest, UserId};

use crate::context::Context;

/// Arguments for the `create` command.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// User id.
    pub user: String,

    /// CPU cores (default 2).
    #[arg(long)]
    pub cpu: Option<u32>,

    /// Memory in MiB (default 8192).
    #[arg(long)]
    pub memory_mb: Option<u32>,

    /// Fast-tier quota in GiB; 0 disables the workspace volume.
    #[arg(long)]
    pub ssd_gb: Option<u32>,

    /// Capacity-tier quota in GiB; 0 disables the storage volume.
    #[arg(long)]
    pub hdd_gb: Option<u32>,

    /// Public key to authorize; the user's stored keys are used otherwise.
    #[arg(long, conflicts_with = "ssh_key_file")]
    pub ssh_key: Option<String>,

    /// File holding the public key to authorize.
    #[arg(long)]
    pub ssh_key_file: Option<PathBuf>,
}

/// Executes the `create` command.
///
/// # Errors
///
/// Returns an error if the key file cannot be read or creation fails.
pub async fn execute(ctx: &Context, args: CreateArgs) -> anyhow::Result<()> {
    let ssh_public_key = match (args.ssh_key, &args.ssh_key_file) {
        (Some(key), _) => Some(key),
        (None, Some(path)) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?
                .trim()
                .to_string(),
        ),
        (None, None) => None,
    };
    let request = ResourceRequest {
        cpu_cores: args.cpu,
        memory_mb: args.memory_mb,
        storage_ssd_gb: args.ssd_gb,
        storage_hdd_gb: args.hdd_gb,
        ssh_public_key,
    };

    let manager = ctx.manager().await?;
    let user = UserId::new(args.user);
    let record = manager
        .create(&user, &request)
        .await
        .with_context(|| format!("failed to create container for {user}"))?;

    println!("Created {} ({})", record.name, record.status);
    println!("SSH port: {}", record.ssh_port);
    Ok(())
}
