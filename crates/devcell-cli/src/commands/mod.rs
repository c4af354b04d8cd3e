//! CLI command definitions and dispatch.

pub mod allocate;
pub mod create;
pub mod exec;
pub mod key;
pub mod preflight;
pub mod ps;
pub mod rebuild;
pub mod reconcile;
pub mod remove;
pub mod resize;
pub mod restart;
pub mod start;
pub mod status;
pub mod stop;
pub mod user;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::context::Context;

/// devcell - per-user development containers with quota-enforced storage.
#[derive(Parser, Debug)]
#[command(name = "devcellctl", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file.
    #[arg(
        long,
        global = true,
        env = "DEVCELL_CONFIG",
        default_value = devcell_common::constants::DEFAULT_CONFIG_FILE
    )]
    pub config: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log output formats.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision storage and create a user's container.
    Create(create::CreateArgs),
    /// Start a stopped container.
    Start(start::StartArgs),
    /// Stop a running container.
    Stop(stop::StopArgs),
    /// Stop and start a container, remounting its storage.
    Restart(restart::RestartArgs),
    /// Destroy and recreate a container, keeping its storage.
    Rebuild(rebuild::RebuildArgs),
    /// Remove a container and release its port.
    Remove(remove::RemoveArgs),
    /// Change the storage quotas of a user.
    Resize(resize::ResizeArgs),
    /// Change the CPU or memory allocation of a user.
    Allocate(allocate::AllocateArgs),
    /// Show a container's stored and live state.
    Status(status::StatusArgs),
    /// List container records.
    Ps(ps::PsArgs),
    /// Correct status drift and record usage samples.
    Reconcile(reconcile::ReconcileArgs),
    /// Execute a command inside a running container.
    Exec(exec::ExecArgs),
    /// Manage users.
    User(user::UserArgs),
    /// Manage SSH keys.
    Key(key::KeyArgs),
    /// Check host tools, the runtime, and the state store.
    Preflight(preflight::PreflightArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the command fails.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let ctx = Context::load(&cli.config)?;
    match cli.command {
        Command::Create(args) => create::execute(&ctx, args).await,
        Command::Start(args) => start::execute(&ctx, args).await,
        Command::Stop(args) => stop::execute(&ctx, args).await,
        Command::Restart(args) => restart::execute(&ctx, args).await,
        Command::Rebuild(args) => rebuild::execute(&ctx, args).await,
        Command::Remove(args) => remove::execute(&ctx, args).await,
        Command::Resize(args) => resize::execute(&ctx, args).await,
        Command::Allocate(args) => allocate::execute(&ctx, args).await,
        Command::Status(args) => status::execute(&ctx, args).await,
        Command::Ps(args) => ps::execute(&ctx, &args),
        Command::Reconcile(args) => reconcile::execute(&ctx, args).await,
        Command::Exec(args) => exec::execute(&ctx, args).await,
        Command::User(args) => user::execute(&ctx, args),
        Command::Key(args) => key::execute(&ctx, args),
        Command::Preflight(args) => preflight::execute(&ctx, &args).await,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn create_accepts_resource_overrides() {
        let cli = Cli::try_parse_from([
            "devcellctl",
            "create",
            "alice",
            "--cpu",
            "4",
            "--ssd-gb",
            "10",
            "--hdd-gb",
            "0",
        ])
        .unwrap();
        let Command::Create(args) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(args.user, "alice");
        assert_eq!(args.cpu, Some(4));
        assert_eq!(args.ssd_gb, Some(10));
        assert_eq!(args.hdd_gb, Some(0));
        assert_eq!(args.memory_mb, None);
    }

    #[test]
    fn global_flags_apply_after_subcommand() {
        let cli = Cli::try_parse_from([
            "devcellctl",
            "ps",
            "--config",
            "/tmp/devcell.toml",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/devcell.toml"));
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn reconcile_interval_requires_watch() {
        assert!(Cli::try_parse_from(["devcellctl", "reconcile", "--interval", "30"]).is_err());
        assert!(Cli::try_parse_from(["devcellctl", "reconcile", "--watch", "--interval", "30"]).is_ok());
    }

    #[test]
    fn reconcile_interval_must_be_positive() {
        assert!(Cli::try_parse_from(["devcellctl", "reconcile", "--watch", "--interval", "0"]).is_err());
    }

    #[test]
    fn exec_keeps_trailing_arguments() {
        let cli = Cli::try_parse_from(["devcellctl", "exec", "alice", "--", "ls", "-la", "/workspace"])
            .unwrap();
        let Command::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(args.command, ["ls", "-la", "/workspace"]);
    }

    #[test]
    fn nested_user_and_key_commands_parse() {
        assert!(Cli::try_parse_from(["devcellctl", "user", "add", "alice"]).is_ok());
        assert!(Cli::try_parse_from(["devcellctl", "key", "add", "alice", "ssh-ed25519 AAAA"]).is_ok());
        assert!(Cli::try_parse_from(["devcellctl", "user"]).is_err());
    }
}
