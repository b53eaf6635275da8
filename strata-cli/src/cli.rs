//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};

/// Strata - schema migrations compiled into your binary
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(version)]
#[command(about = "Strata - schema migrations compiled into your binary", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub url: String,

    /// Per-unit timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply pending migrations
    Up(UpArgs),

    /// Revert applied migrations
    Down(DownArgs),

    /// Show applied and pending migrations
    Status(StatusArgs),
}

/// Arguments for the `up` command
#[derive(Args, Debug)]
pub struct UpArgs {
    /// Stop after this version (default: apply everything)
    #[arg(long)]
    pub to: Option<i64>,

    /// Plan and report without executing
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the `down` command
#[derive(Args, Debug)]
pub struct DownArgs {
    /// Revert everything above this version (0 reverts all)
    #[arg(long)]
    pub to: i64,

    /// Plan and report without executing
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the `status` command
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_up_with_bound() {
        let cli = Cli::try_parse_from([
            "strata",
            "--url",
            "postgresql://localhost/db",
            "up",
            "--to",
            "42",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Command::Up(args) => {
                assert_eq!(args.to, Some(42));
                assert!(args.dry_run);
            }
            other => panic!("expected Up, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_down_requires_target() {
        let result = Cli::try_parse_from(["strata", "--url", "postgresql://localhost/db", "down"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_status_json() {
        let cli = Cli::try_parse_from([
            "strata",
            "--url",
            "postgresql://localhost/db",
            "--timeout",
            "120",
            "status",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.timeout, Some(120));
        match cli.command {
            Command::Status(args) => assert!(args.json),
            other => panic!("expected Status, got {other:?}"),
        }
    }
}
