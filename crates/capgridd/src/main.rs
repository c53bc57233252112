//! capgridd — the capgrid daemon.
//!
//! # Usage
//!
//! ```text
//! capgridd simulate --config cluster.toml [--log-json]
//! capgridd check-config --config cluster.toml
//! ```
//!
//! `simulate` prints one JSON line per attempt per heartbeat on stdout,
//! followed by a summary line; logs go to stderr.

use std::path::PathBuf;

use anyhow::Context;
use capgrid_core::Resource;
use capgridd::ClusterConfig;
use capgridd::simulate::{AttemptSummary, PassStats};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "capgridd", about = "capgrid scheduler daemon")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a scheduling simulation over a cluster description.
    Simulate {
        /// Path to the cluster TOML file.
        #[arg(long)]
        config: PathBuf,
    },
    /// Validate a cluster description and print the effective scheduler config.
    CheckConfig {
        /// Path to the cluster TOML file.
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Serialize)]
struct Summary<'a> {
    cluster: Resource,
    passes: PassStats,
    preempted: u64,
    attempts: &'a [AttemptSummary],
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,capgridd=debug,capgrid=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Simulate { config } => {
            let cluster = ClusterConfig::from_file(&config)?;
            info!(path = %config.display(), "starting simulation");
            let report = capgridd::run(cluster).await?;

            for record in &report.heartbeats {
                println!("{}", serde_json::to_string(record).context("encoding heartbeat")?);
            }
            let summary = Summary {
                cluster: report.cluster,
                passes: report.passes,
                preempted: report.preempted,
                attempts: &report.attempts,
            };
            println!("{}", serde_json::to_string(&summary).context("encoding summary")?);
            Ok(())
        }
        Command::CheckConfig { config } => {
            let cluster = ClusterConfig::from_file(&config)?;
            println!(
                "ok: {} nodes, {} queues, {} attempts, cluster {}, partitions {:?}",
                cluster.nodes.len(),
                cluster.queues.len(),
                cluster.attempts.len(),
                cluster.cluster_resource(),
                cluster.partitions(),
            );
            print!("{}", cluster.scheduler.to_toml_string()?);
            Ok(())
        }
    }
}
