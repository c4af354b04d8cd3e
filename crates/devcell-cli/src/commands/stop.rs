//! `devcellctl stop` - Stop a running container.

use anyhow::Context as _;
use clap::Args;
use devcell_common::types::UserId;

use crate::context::Context;

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// User id.
    pub user: String,
}

/// Executes the `stop` command.
///
/// # Errors
///
/// Returns an error if the runtime is unreachable or the stop fails.
pub async fn execute(ctx: &Context, args: StopArgs) -> anyhow::Result<()> {
    let manager = ctx.manager().await?;
    let user = UserId::new(args.user);
    let record = manager
        .stop(&user)
        .await
        .with_context(|| format!("failed to stop container of {user}"))?;
    println!("Stopped {} ({})", record.name, record.status);
    Ok(())
}
