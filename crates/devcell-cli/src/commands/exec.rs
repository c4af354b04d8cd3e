//! `devcellctl exec` - Execute a command inside a running container.

use clap::Args;
use devcell_common::types::UserId;

use crate::context::Context;

/// Arguments for the `exec` command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// User id.
    pub user: String,

    /// Command to execute.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `exec` command, forwarding output and the exit code.
///
/// # Errors
///
/// Returns an error if the container is not running or the exec fails.
pub async fn execute(ctx: &Context, args: ExecArgs) -> anyhow::Result<()> {
    let manager = ctx.manager().await?;
    let output = manager.exec(&UserId::new(args.user), &args.command).await?;

    if !output.stdout.is_empty() {
        print!("{}", output.stdout);
    }
    if !output.stderr.is_empty() {
        #[allow(clippy::print_stderr)]
        {
            eprint!("{}", output.stderr);
        }
    }

    if !output.success() {
        std::process::exit(i32::try_from(output.exit_code).unwrap_or(1));
    }
    Ok(())
}
