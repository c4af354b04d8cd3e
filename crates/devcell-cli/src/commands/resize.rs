//! `devcellctl resize` - Change the storage quotas of a user.

use anyhow::Context as _;
use clap::Args;
use devcell_common::types::{ResourceAllocation, UserId};

use crate::context::Context;

/// Arguments for the `resize` command.
#[derive(Args, Debug)]
pub struct ResizeArgs {
    /// User id.
    pub user: String,

    /// New fast-tier quota in GiB; keeps the current quota if omitted.
    #[arg(long)]
    pub ssd_gb: Option<u32>,

    /// New capacity-tier quota in GiB; keeps the current quota if omitted.
    #[arg(long)]
    pub hdd_gb: Option<u32>,
}

/// Executes the `resize` command.
///
/// A running container is stopped around a shrink and started again.
///
/// # Errors
///
/// Returns an error if the shrink is refused or a disk operation fails.
pub async fn execute(ctx: &Context, args: ResizeArgs) -> anyhow::Result<()> {
    if args.ssd_gb.is_none() && args.hdd_gb.is_none() {
        anyhow::bail!("nothing to resize: pass --ssd-gb and/or --hdd-gb");
    }
    let manager = ctx.manager().await?;
    let user = UserId::new(args.user);
    let current = manager
        .store()
        .find_allocation(&user)?
        .unwrap_or_else(|| ResourceAllocation::defaults(user.clone()));
    let ssd = args.ssd_gb.unwrap_or(current.storage_ssd_gb);
    let hdd = args.hdd_gb.unwrap_or(current.storage_hdd_gb);

    let allocation = manager
        .resize_storage(&user, ssd, hdd)
        .await
        .with_context(|| format!("failed to resize storage of {user}"))?;
    println!(
        "Storage of {user}: ssd {} GiB, hdd {} GiB",
        allocation.storage_ssd_gb, allocation.storage_hdd_gb
    );
    Ok(())
}
