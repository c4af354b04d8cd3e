//! `devcellctl user` - Manage users.

use anyhow::Context as _;
use clap::{Args, Subcommand};
use devcell_common::types::{UserAccount, UserId};

use crate::context::Context;

/// Arguments for the `user` command.
#[derive(Args, Debug)]
pub struct UserArgs {
    /// User action.
    #[command(subcommand)]
    pub action: UserAction,
}

/// User actions.
#[derive(Subcommand, Debug)]
pub enum UserAction {
    /// Register a user.
    Add {
        /// Login name; becomes the container name suffix and the storage
        /// directory.
        username: String,

        /// User id; defaults to the username.
        #[arg(long)]
        id: Option<String>,
    },
}

/// Executes the `user` command.
///
/// # Errors
///
/// Returns an error if the username is invalid or already registered.
pub fn execute(ctx: &Context, args: UserArgs) -> anyhow::Result<()> {
    match args.action {
        UserAction::Add { username, id } => {
            let id = UserId::new(id.unwrap_or_else(|| username.clone()));
            let account = UserAccount::new(id, username)?;
            ctx.store()?
                .insert_user(&account)
                .with_context(|| format!("failed to register {}", account.username))?;
            println!("Registered {} (id {})", account.username, account.id);
        }
    }
    Ok(())
}
