//! `devcellctl reconcile` - Correct status drift and record usage samples.

use std::time::Duration;

use clap::Args;
use devcell_runtime::metrics::Reconciler;

use crate::context::Context;
use crate::output;

/// Arguments for the `reconcile` command.
#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Keep running until interrupted.
    #[arg(long)]
    pub watch: bool,

    /// Seconds between passes in watch mode; defaults to the configured
    /// interval.
    #[arg(long, requires = "watch", value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: Option<u64>,
}

/// Executes the `reconcile` command.
///
/// # Errors
///
/// Returns an error if the runtime is unreachable or records cannot be
/// listed.
pub async fn execute(ctx: &Context, args: ReconcileArgs) -> anyhow::Result<()> {
    let reconciler = Reconciler::new(ctx.manager().await?);

    if args.watch {
        let interval = args
            .interval
            .map_or_else(|| ctx.config.reconciler.interval(), Duration::from_secs);
        reconciler
            .run(interval, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "cannot listen for interrupt");
                }
            })
            .await;
        return Ok(());
    }

    let drifts = reconciler.reconcile_all().await?;
    for d in &drifts {
        println!("{}: {} -> {} (runtime: {})", d.user_id, d.from, d.to, d.live);
    }
    let samples = reconciler.snapshot_all().await?;
    println!(
        "Corrected {} record(s), sampled {} container(s)",
        drifts.len(),
        samples.len()
    );
    match reconciler.host_snapshot().await {
        Ok(host) => println!(
            "Host: ssd {} / {}, hdd {} / {}, memory {} MiB free of {} MiB, load {:.2} {:.2} {:.2}",
            output::format_bytes(host.ssd.used_bytes),
            output::format_bytes(host.ssd.total_bytes),
            output::format_bytes(host.hdd.used_bytes),
            output::format_bytes(host.hdd.total_bytes),
            host.memory.available_mb,
            host.memory.total_mb,
            host.load.one,
            host.load.five,
            host.load.fifteen,
        ),
        Err(e) => tracing::warn!(error = %e, "host snapshot failed"),
    }
    Ok(())
}
