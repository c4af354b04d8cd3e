//! `devcellctl restart` - Stop and start a container, remounting its storage.

use anyhow::Context as _;
use clap::Args;
use devcell_common::types::UserId;

use crate::context::Context;

/// Arguments for the `restart` command.
#[derive(Args, Debug)]
pub struct RestartArgs {
    /// User id.
    pub user: String,
}

/// Executes the `restart` command.
///
/// # Errors
///
/// Returns an error if the runtime is unreachable or the restart fails.
pub async fn execute(ctx: &Context, args: RestartArgs) -> anyhow::Result<()> {
    let manager = ctx.manager().await?;
    let user = UserId::new(args.user);
    let record = manager
        .restart(&user)
        .await
        .with_context(|| format!("failed to restart container of {user}"))?;
    println!("Restarted {} ({})", record.name, record.status);
    Ok(())
}
