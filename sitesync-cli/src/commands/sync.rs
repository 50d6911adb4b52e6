//! `sitesync sync`, `sitesync import` and `sitesync cleanup`

use anyhow::{Context, Result};
use clap::Args;

use sitesync_sync::{ImportReport, SyncReport};

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Site to sync (omit when using `--all`).
    pub site: Option<String>,

    /// Sync every registered site.
    #[arg(long, conflicts_with = "site")]
    pub all: bool,

    /// Sync a single content item instead of the whole site.
    #[arg(long, requires = "site")]
    pub item: Option<String>,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let engine = super::engine()?;

        if let (Some(site), Some(item)) = (&self.site, &self.item) {
            let result = engine
                .sync_content_item(site, item)
                .with_context(|| format!("sync failed for '{site}/{item}'"))?;
            match result {
                Some(result) if result.deleted => println!("✓ '{site}/{item}' deleted from backend"),
                Some(result) => println!(
                    "✓ '{site}/{item}' synced to {}",
                    result.path.as_deref().unwrap_or("?")
                ),
                None => println!("✓ '{site}/{item}' — nothing to do"),
            }
            return Ok(());
        }

        let sites = if self.all {
            engine.site_names().context("failed to list sites")?
        } else {
            vec![self.site.clone().context("provide a site name or use --all")?]
        };
        if sites.is_empty() {
            println!("No sites registered. Run `sitesync site add <name>` first.");
        }
        for site in sites {
            let report = engine
                .sync_site(&site)
                .with_context(|| format!("sync failed for '{site}'"))?;
            match report {
                Some(report) => print_sync(&site, &report),
                None => println!("backend sync disabled; skipped '{site}'"),
            }
        }
        Ok(())
    }
}

fn print_sync(site: &str, report: &SyncReport) {
    if report.synced.is_empty() && report.deleted.is_empty() && report.failed.is_empty() {
        println!("✓ '{site}' — nothing to do");
        return;
    }
    println!(
        "✓ '{site}' synced ({} written, {} deleted, {} failed, {} commits)",
        report.synced.len(),
        report.deleted.len(),
        report.failed.len(),
        report.commits
    );
    for id in &report.synced {
        println!("  ✎  {id}");
    }
    for id in &report.deleted {
        println!("  ✗  {id}");
    }
    for (id, error) in &report.failed {
        println!("  !  {id}: {error}");
    }
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    pub site: String,

    /// Import as of this commit or branch; the store is not made authoritative.
    #[arg(long = "ref")]
    pub git_ref: Option<String>,

    /// Only import under this backend path.
    #[arg(long)]
    pub path: Option<String>,
}

impl ImportArgs {
    pub fn run(self) -> Result<()> {
        let engine = super::engine()?;
        let report = engine
            .import_site(&self.site, self.git_ref.as_deref(), self.path.as_deref())
            .with_context(|| format!("import failed for '{}'", self.site))?;
        match report {
            Some(report) => print_import(&self.site, &report),
            None => println!("backend sync disabled; nothing imported"),
        }
        Ok(())
    }
}

fn print_import(site: &str, report: &ImportReport) {
    println!(
        "✓ '{site}' imported ({} created, {} updated, {} deleted, {} skipped)",
        report.created.len(),
        report.updated.len(),
        report.deleted.len(),
        report.skipped.len()
    );
    for (path, reason) in &report.skipped {
        println!("  !  {path}: {reason}");
    }
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    pub site: String,
}

impl CleanupArgs {
    pub fn run(self) -> Result<()> {
        let engine = super::engine()?;
        let removed = engine
            .cleanup_site(&self.site)
            .with_context(|| format!("cleanup failed for '{}'", self.site))?;
        match removed {
            Some(paths) if paths.is_empty() => println!("✓ '{}' — no orphaned files", self.site),
            Some(paths) => {
                println!("✓ '{}' removed {} orphaned file(s)", self.site, paths.len());
                for path in paths {
                    println!("  ✗  {path}");
                }
            }
            None => println!("backend sync disabled; nothing to do"),
        }
        Ok(())
    }
}
