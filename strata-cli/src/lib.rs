//! # strata-cli
//!
//! Embeddable command-line harness for Strata migration binaries.
//!
//! Change units are compiled into the application, so the binary belongs to
//! the application too: build your registry and hand it to [`run`] from your
//! own `main`.
//!
//! ```rust,ignore
//! use std::process::ExitCode;
//!
//! #[tokio::main]
//! async fn main() -> ExitCode {
//!     let registry = myapp_migrations::registry();
//!     strata_cli::run(&registry).await
//! }
//! ```

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use serde_json::json;

use strata_migrate::{MigrationRegistry, MigrationRunner, RunnerConfig, Target};
use strata_postgres::{PgAccess, PgConfig};

pub mod cli;
pub mod output;

use cli::{Cli, Command};

/// Parse arguments, connect, and run the requested command against the
/// registry. Returns the process exit code.
pub async fn run(registry: &MigrationRegistry) -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(registry, cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output::newline();
            output::error(&e.to_string());
            if let Some(version) = e.failing_version() {
                output::info(&format!(
                    "versions below {version} are applied and committed; fix the fault and re-run"
                ));
            }
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(
    registry: &MigrationRegistry,
    cli: Cli,
) -> strata_migrate::MigrateResult<()> {
    let config = PgConfig::from_url(&cli.url)?;
    let access = PgAccess::connect(&config).await?;

    let mut runner_config = RunnerConfig::default();
    if let Some(secs) = cli.timeout {
        runner_config = runner_config.unit_timeout(Duration::from_secs(secs));
    }

    match cli.command {
        Command::Up(args) => {
            let runner = MigrationRunner::with_config(
                registry,
                &access,
                runner_config.dry_run(args.dry_run),
            );
            let target = match args.to {
                Some(version) => Target::Version(version),
                None => Target::Latest,
            };
            let report = runner.up_to(target).await?;
            for warning in &report.warnings {
                output::warn(warning);
            }
            output::success(&report.summary());
            Ok(())
        }
        Command::Down(args) => {
            let runner = MigrationRunner::with_config(
                registry,
                &access,
                runner_config.dry_run(args.dry_run),
            );
            let report = runner.down_to(args.to).await?;
            for warning in &report.warnings {
                output::warn(warning);
            }
            output::success(&report.summary());
            Ok(())
        }
        Command::Status(args) => {
            let runner = MigrationRunner::with_config(registry, &access, runner_config);
            let status = runner.status().await?;
            if args.json {
                let doc = json!({
                    "applied": status.applied,
                    "pending": status.pending,
                });
                println!("{doc:#}");
                return Ok(());
            }
            output::header("Migration Status");
            output::list(&format!("{} applied:", status.applied.len()));
            for record in &status.applied {
                output::list_item(&output::style_success(&format!(
                    "{} {} ({})",
                    record.version,
                    record.name,
                    record.applied_at.format("%Y-%m-%d %H:%M:%S UTC")
                )));
            }
            output::newline();
            output::list(&format!("{} pending:", status.pending.len()));
            for version in &status.pending {
                output::list_item(&output::style_pending(&version.to_string()));
            }
            Ok(())
        }
    }
}
