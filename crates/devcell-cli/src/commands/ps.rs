//! `devcellctl ps` - List container records.

use clap::Args;
use devcell_common::types::ContainerStatus;

use crate::context::Context;
use crate::output;

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Show all containers (including stopped and failed).
    #[arg(short, long)]
    pub all: bool,

    /// Print records as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `ps` command.
///
/// Reads the state store only; live runtime state is shown by `status`.
///
/// # Errors
///
/// Returns an error if the state store cannot be read.
pub fn execute(ctx: &Context, args: &PsArgs) -> anyhow::Result<()> {
    let records: Vec<_> = ctx
        .store()?
        .list_containers()?
        .into_iter()
        .filter(|r| args.all || r.status == ContainerStatus::Running)
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No containers found.");
        return Ok(());
    }
    print!("{}", output::record_table(&records, chrono::Utc::now()));
    Ok(())
}
