//! `devcellctl remove` - Remove a container and release its port.

use anyhow::Context as _;
use clap::Args;
use devcell_common::config::RetentionPolicy;
use devcell_common::types::UserId;

use crate::context::Context;

/// Arguments for the `remove` command.
#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// User id.
    pub user: String,
}

/// Executes the `remove` command.
///
/// Storage images are kept or deleted according to the configured
/// retention policy.
///
/// # Errors
///
/// Returns an error if the runtime is unreachable or removal fails.
pub async fn execute(ctx: &Context, args: RemoveArgs) -> anyhow::Result<()> {
    let manager = ctx.manager().await?;
    let user = UserId::new(args.user);
    manager
        .remove(&user)
        .await
        .with_context(|| format!("failed to remove container of {user}"))?;
    match ctx.config.runtime.retention {
        RetentionPolicy::KeepImages => println!("Removed container of {user}; storage images kept"),
        RetentionPolicy::DeleteImages => println!("Removed container and storage of {user}"),
    }
    Ok(())
}
