//! `devcellctl allocate` - Change the CPU or memory allocation of a user.

use anyhow::Context as _;
use clap::Args;
use devcell_common::types::UserId;

use crate::context::Context;

/// Arguments for the `allocate` command.
#[derive(Args, Debug)]
pub struct AllocateArgs {
    /// User id.
    pub user: String,

    /// CPU cores (1-8).
    #[arg(long)]
    pub cpu: Option<u32>,

    /// Memory in MiB (1024-32768).
    #[arg(long)]
    pub memory_mb: Option<u32>,
}

/// Executes the `allocate` command.
///
/// The new limits apply on the next rebuild.
///
/// # Errors
///
/// Returns an error if a value is out of range or the user is unknown.
pub async fn execute(ctx: &Context, args: AllocateArgs) -> anyhow::Result<()> {
    if args.cpu.is_none() && args.memory_mb.is_none() {
        anyhow::bail!("nothing to change: pass --cpu and/or --memory-mb");
    }
    let manager = ctx.manager().await?;
    let user = UserId::new(args.user);
    let allocation = manager
        .update_allocation(&user, args.cpu, args.memory_mb)
        .await
        .with_context(|| format!("failed to update allocation of {user}"))?;
    println!(
        "Allocation of {user}: {} cores, {} MiB (applies on rebuild)",
        allocation.cpu_cores, allocation.memory_mb
    );
    Ok(())
}
