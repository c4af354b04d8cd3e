//! `devcellctl key` - Manage SSH keys.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Args, Subcommand};
use devcell_common::types::UserId;

use crate::context::Context;

/// Arguments for the `key` command.
#[derive(Args, Debug)]
pub struct KeyArgs {
    /// Key action.
    #[command(subcommand)]
    pub action: KeyAction,
}

/// Key actions.
#[derive(Subcommand, Debug)]
pub enum KeyAction {
    /// Authorize a public key for a user's containers.
    ///
    /// The key is injected on the next create or rebuild.
    Add {
        /// User id.
        user: String,

        /// Key in `authorized_keys` format.
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        key: Option<String>,

        /// File holding the key.
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

/// Executes the `key` command.
///
/// # Errors
///
/// Returns an error if the key is malformed or the user is unknown.
pub fn execute(ctx: &Context, args: KeyArgs) -> anyhow::Result<()> {
    match args.action {
        KeyAction::Add { user, key, file } => {
            let key = match (key, file) {
                (Some(key), _) => key,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("cannot read {}", path.display()))?,
                (None, None) => anyhow::bail!("no key given"),
            };
            let key = normalize_key(&key)?;
            let user = UserId::new(user);
            ctx.store()?
                .add_ssh_key(&user, &key)
                .with_context(|| format!("failed to add key for {user}"))?;
            println!("Added key for {user}; applies on next create or rebuild");
        }
    }
    Ok(())
}

/// Trims a key and checks it is a single `<type> <base64> [comment]` line.
fn normalize_key(raw: &str) -> anyhow::Result<String> {
    let key = raw.trim();
    if key.lines().count() != 1 {
        anyhow::bail!("expected exactly one public key line");
    }
    if key.split_whitespace().count() < 2 {
        anyhow::bail!("malformed public key: expected '<type> <key> [comment]'");
    }
    Ok(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_trimmed() {
        assert_eq!(
            normalize_key("  ssh-ed25519 AAAAC3 alice@laptop\n").unwrap(),
            "ssh-ed25519 AAAAC3 alice@laptop"
        );
    }

    #[test]
    fn multiple_lines_are_rejected() {
        assert!(normalize_key("ssh-ed25519 AAAA\nssh-rsa BBBB").is_err());
        assert!(normalize_key("   ").is_err());
    }

    #[test]
    fn bare_type_is_rejected() {
        assert!(normalize_key("ssh-ed25519").is_err());
    }
}
