//! sitesync — content sync and publish orchestration CLI.
//!
//! # Usage
//!
//! ```text
//! sitesync site add <name> | site list
//! sitesync backend create <site>
//! sitesync sync <site> [--item <id>] | sync --all
//! sitesync import <site> [--ref <sha>] [--path <dir>]
//! sitesync cleanup <site>
//! sitesync publish <site> <draft|live> [--by <user>]
//! sitesync publish-batch <draft|live> [--site <name>...] [--mass-build] [--by <user>]
//! sitesync pipelines [--site <name>...]
//! sitesync reconcile
//! sitesync status [--json]
//! sitesync diff <site>
//! sitesync daemon start|stop|status
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    backend::BackendCommand,
    daemon::DaemonCommand,
    diff::DiffArgs,
    publish::{PipelinesArgs, PublishArgs, PublishBatchArgs},
    site::SiteCommand,
    status::StatusArgs,
    sync::{CleanupArgs, ImportArgs, SyncArgs},
};

#[derive(Parser, Debug)]
#[command(
    name = "sitesync",
    version,
    about = "Sync site content to git backends and publish it through build pipelines",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register and list sites.
    Site {
        #[command(subcommand)]
        command: SiteCommand,
    },

    /// Manage a site's backend repository.
    Backend {
        #[command(subcommand)]
        command: BackendCommand,
    },

    /// Push dirty content to the backend.
    Sync(SyncArgs),

    /// Pull backend files into the store.
    Import(ImportArgs),

    /// Delete backend files no content item accounts for.
    Cleanup(CleanupArgs),

    /// Publish one site at a version.
    Publish(PublishArgs),

    /// Publish many sites at a version in chunks.
    PublishBatch(PublishBatchArgs),

    /// Render and upsert build pipelines.
    Pipelines(PipelinesArgs),

    /// Poll outstanding builds and record their status.
    Reconcile,

    /// Show per-site sync and publish status.
    Status(StatusArgs),

    /// Show unified diff of what sync would push for a site.
    Diff(DiffArgs),

    /// Run or control the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Site { command } => commands::site::run(command),
        Commands::Backend { command } => commands::backend::run(command),
        Commands::Sync(args) => args.run(),
        Commands::Import(args) => args.run(),
        Commands::Cleanup(args) => args.run(),
        Commands::Publish(args) => args.run(),
        Commands::PublishBatch(args) => args.run(),
        Commands::Pipelines(args) => args.run(),
        Commands::Reconcile => commands::publish::reconcile(),
        Commands::Status(args) => args.run(),
        Commands::Diff(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
