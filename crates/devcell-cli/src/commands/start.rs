//! `devcellctl start` - Start a stopped container.

use anyhow::Context as _;
use clap::Args;
use devcell_common::types::UserId;

use crate::context::Context;

/// Arguments for the `start` command.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// User id.
    pub user: String,
}

/// Executes the `start` command.
///
/// # Errors
///
/// Returns an error if the runtime is unreachable or the start fails.
pub async fn execute(ctx: &Context, args: StartArgs) -> anyhow::Result<()> {
    let manager = ctx.manager().await?;
    let user = UserId::new(args.user);
    let record = manager
        .start(&user)
        .await
        .with_context(|| format!("failed to start container of {user}"))?;
    println!("Started {} ({})", record.name, record.status);
    Ok(())
}
