//! `devcellctl status` - Show a container's stored and live state.

use anyhow::Context as _;
use clap::Args;
use devcell_common::constants::MIB;
use devcell_common::types::{ContainerStatus, UserId};

use crate::context::Context;
use crate::output;

/// Arguments for the `status` command.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// User id.
    pub user: String,

    /// Number of recent activity entries to show.
    #[arg(long, default_value_t = 5)]
    pub activity: usize,

    /// Print the record and live state as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `status` command.
///
/// # Errors
///
/// Returns an error if the store or runtime cannot be queried.
pub async fn execute(ctx: &Context, args: StatusArgs) -> anyhow::Result<()> {
    let manager = ctx.manager().await?;
    let user = UserId::new(args.user);
    let Some(report) = manager
        .status(&user)
        .await
        .with_context(|| format!("failed to query status of {user}"))?
    else {
        println!("No container for {user}.");
        return Ok(());
    };

    if args.json {
        let value = serde_json::json!({
            "record": report.record,
            "live": report.live.to_string(),
            "discrepancy": report.discrepancy().map(ContainerStatus::as_str),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let record = &report.record;
    println!("Container: {}", record.name);
    println!("Status:    {} (runtime: {})", record.status, report.live);
    if let Some(expected) = report.discrepancy() {
        println!("Warning:   runtime disagrees; reconcile would set {expected}");
    }
    println!("SSH port:  {}", record.ssh_port);
    if let Some(id) = &record.runtime_id {
        println!("ID:        {}", id.short());
    }
    if let Some(a) = manager.store().find_allocation(&user)? {
        println!(
            "Quota:     {} cores, {} MiB, ssd {} GiB, hdd {} GiB",
            a.cpu_cores, a.memory_mb, a.storage_ssd_gb, a.storage_hdd_gb
        );
    }

    if record.status == ContainerStatus::Running {
        match manager.stats(&user).await {
            Ok(stats) => println!(
                "Usage:     cpu {:.1}%, mem {} / {} MiB, net rx {} tx {}",
                stats.cpu_percent(),
                stats.memory_used_bytes() / MIB,
                stats.memory_limit_bytes / MIB,
                output::format_bytes(stats.network_rx_bytes),
                output::format_bytes(stats.network_tx_bytes),
            ),
            Err(e) => tracing::warn!(user = %user, error = %e, "live stats unavailable"),
        }
    }

    let entries = manager.activity(&user, args.activity)?;
    if !entries.is_empty() {
        println!("Recent activity:");
        print!("{}", output::activity_lines(&entries));
    }
    Ok(())
}
