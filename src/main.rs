//! Kuack E2E - maintenance commands for the end-to-end harness

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*};

use kuack_e2e::config::HarnessConfig;
use kuack_e2e::logs;
use kuack_e2e::release::{ProcessRunner, ReleaseManager};
use kuack_e2e::session::ClusterSession;
use kuack_e2e::worker;

/// Kuack E2E - environment lifecycle for Kuack end-to-end tests
#[derive(Parser, Debug)]
#[command(name = "kuack-e2e", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Remove releases and pods left behind by crashed runs
    ///
    /// Deletes every release whose name matches the pattern and every pod
    /// carrying the harness's managed-by label, in the current namespace.
    Cleanup(CleanupArgs),
}

/// Cleanup arguments
#[derive(Parser, Debug)]
struct CleanupArgs {
    /// Regex matched against release names (defaults to every node and agent release)
    #[arg(long, env = "CLEANUP_PATTERN")]
    pattern: Option<String>,

    /// Print the cleanup report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(logs::env_filter())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Cleanup(args) => run_cleanup(args).await,
    }
}

/// Sweep leftover harness resources from the current namespace
async fn run_cleanup(args: CleanupArgs) -> anyhow::Result<()> {
    let config = HarnessConfig::from_env()?;
    let session = ClusterSession::init().await?;
    let releases = ReleaseManager::new(
        Arc::new(ProcessRunner),
        session.namespace(),
        &config.helm_binary,
    );

    let pattern = args
        .pattern
        .unwrap_or_else(|| config.release_sweep_pattern());
    info!(namespace = %session.namespace(), pattern = %pattern, "Starting cleanup");

    let report = worker::sweep(&session, &releases, &pattern).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for entry in report.entries() {
            println!("{:<60} {}", entry.resource, entry.outcome);
        }
        println!("{} resource(s) processed", report.len());
    }

    if !report.is_clean() {
        anyhow::bail!(
            "cleanup left {} resource(s) behind",
            report.failures().count()
        );
    }
    Ok(())
}
