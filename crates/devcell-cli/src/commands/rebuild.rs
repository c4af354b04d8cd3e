//! `devcellctl rebuild` - Destroy and recreate a container, keeping its storage.

use anyhow::Context as _;
use clap::Args;
use devcell_common::types::UserId;

use crate::context::Context;

/// Arguments for the `rebuild` command.
#[derive(Args, Debug)]
pub struct RebuildArgs {
    /// User id.
    pub user: String,
}

/// Executes the `rebuild` command.
///
/// # Errors
///
/// Returns an error if the runtime is unreachable or the rebuild fails.
pub async fn execute(ctx: &Context, args: RebuildArgs) -> anyhow::Result<()> {
    let manager = ctx.manager().await?;
    let user = UserId::new(args.user);
    let record = manager
        .rebuild(&user)
        .await
        .with_context(|| format!("failed to rebuild container of {user}"))?;
    println!("Rebuilt {} ({})", record.name, record.status);
    println!("SSH port: {}", record.ssh_port);
    Ok(())
}
