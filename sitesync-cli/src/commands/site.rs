//! `sitesync site add <name>` and `sitesync site list`

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use sitesync_core::{ContentStore, FileStore, Site, SiteConfig};

#[derive(Subcommand, Debug)]
pub enum SiteCommand {
    /// List registered sites with their repositories.
    List,

    /// Register a site. Adding an existing site is a no-op.
    Add(AddArgs),
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Site name (e.g. "Agency Site").
    pub name: String,
}

pub fn run(cmd: SiteCommand) -> Result<()> {
    let home = super::home()?;
    let store = FileStore::open_at(&home).context("failed to open site store")?;
    match cmd {
        SiteCommand::List => list(&store),
        SiteCommand::Add(args) => add(&store, args),
    }
}

fn list(store: &FileStore) -> Result<()> {
    let sites = store.list_sites().context("failed to list sites")?;
    if sites.is_empty() {
        println!("No sites registered.");
        println!("Run: sitesync site add <name>");
        return Ok(());
    }
    for site in sites {
        println!("{} ({})", site.name, site.repo_name());
    }
    Ok(())
}

fn add(store: &FileStore, args: AddArgs) -> Result<()> {
    let site = store
        .insert_site(Site::new(args.name.as_str(), SiteConfig::default()))
        .with_context(|| format!("failed to add site '{}'", args.name))?;
    println!("✓ Added site '{}' (repo {})", site.name, site.repo_name());
    Ok(())
}
