//! `devcellctl preflight` - Check host tools, the runtime, and the state
//! store.

use std::path::PathBuf;

use clap::Args;
use devcell_common::config::StorageConfig;
use devcell_core::host;
use devcell_runtime::backend::docker::DockerRuntime;

use crate::context::Context;

/// Arguments for the `preflight` command.
#[derive(Args, Debug)]
pub struct PreflightArgs {
    /// Skip the container runtime check.
    #[arg(long)]
    pub skip_runtime: bool,
}

/// Executes the `preflight` command.
///
/// # Errors
///
/// Returns an error naming the number of failed checks.
pub async fn execute(ctx: &Context, args: &PreflightArgs) -> anyhow::Result<()> {
    let mut failures = 0_usize;
    let mut report = |name: &str, problem: Option<String>| {
        match problem {
            None => println!("[ ok ] {name}"),
            Some(problem) => {
                failures += 1;
                println!("[FAIL] {name}: {problem}");
            }
        }
    };

    let missing = host::missing_tools(ctx.config.host.sudo);
    report(
        "host tools",
        (!missing.is_empty()).then(|| format!("not on PATH: {}", missing.join(", "))),
    );

    let roots = missing_roots(&ctx.config.storage);
    report(
        "storage roots",
        (!roots.is_empty()).then(|| {
            let list: Vec<String> = roots.iter().map(|p| p.display().to_string()).collect();
            format!("missing: {}", list.join(", "))
        }),
    );

    report("state store", ctx.store().err().map(|e| format!("{e:#}")));

    if !args.skip_runtime {
        report(
            "container runtime",
            DockerRuntime::connect(&ctx.config.runtime)
                .await
                .err()
                .map(|e| e.to_string()),
        );
    }

    if failures > 0 {
        anyhow::bail!("{failures} preflight check(s) failed");
    }
    Ok(())
}

/// Storage roots that do not exist as directories.
fn missing_roots(storage: &StorageConfig) -> Vec<PathBuf> {
    [&storage.ssd_root, &storage.hdd_root, &storage.shared_root]
        .into_iter()
        .filter(|p| !p.is_dir())
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_roots_lists_absent_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("ssd")).unwrap();
        let storage = StorageConfig {
            ssd_root: dir.path().join("ssd"),
            hdd_root: dir.path().join("hdd"),
            shared_root: dir.path().join("shared"),
            ..StorageConfig::default()
        };
        assert_eq!(
            missing_roots(&storage),
            vec![dir.path().join("hdd"), dir.path().join("shared")]
        );
    }
}
