//! `sitesync publish`, `publish-batch`, `pipelines` and `reconcile`

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use sitesync_publish::{BatchOutcome, BatchReport, Engine};

#[derive(Args, Debug)]
pub struct PublishArgs {
    pub site: String,

    /// `draft` (alias `preview`) or `live` (alias `release`).
    pub version: String,

    /// Recorded as the publish trigger.
    #[arg(long)]
    pub by: Option<String>,
}

impl PublishArgs {
    pub fn run(self) -> Result<()> {
        let engine = super::engine()?;
        let outcome = engine
            .publish(&self.site, &self.version, self.by.as_deref())
            .with_context(|| format!("publish failed for '{}' at {}", self.site, self.version))?;
        match outcome.build_id {
            Some(id) => println!(
                "✓ '{}' {} published; build {id} {}",
                outcome.site, outcome.version, outcome.build_status
            ),
            None => println!(
                "✓ '{}' {} published ({})",
                outcome.site, outcome.version, outcome.build_status
            ),
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct PublishBatchArgs {
    pub version: String,

    /// Sites to publish; repeat the flag. Defaults to every site.
    #[arg(long = "site")]
    pub sites: Vec<String>,

    /// Skip per-site builds and trigger one build for all sites.
    #[arg(long)]
    pub mass_build: bool,

    #[arg(long)]
    pub by: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl PublishBatchArgs {
    pub fn run(self) -> Result<()> {
        let engine = super::engine()?;
        let sites = sites_or_all(&engine, self.sites)?;
        let report = super::runtime()?
            .block_on(engine.publish_batch(&sites, &self.version, self.mass_build, self.by.as_deref()))
            .context("batch publish failed")?;
        finish_batch("publish", &report, self.json)
    }
}

#[derive(Args, Debug)]
pub struct PipelinesArgs {
    /// Sites to upsert; repeat the flag. Defaults to every site.
    #[arg(long = "site")]
    pub sites: Vec<String>,

    #[arg(long)]
    pub json: bool,
}

impl PipelinesArgs {
    pub fn run(self) -> Result<()> {
        let engine = super::engine()?;
        let sites = sites_or_all(&engine, self.sites)?;
        let report = super::runtime()?
            .block_on(engine.upsert_pipelines(&sites))
            .context("pipeline upsert failed")?;
        match report {
            Some(report) => finish_batch("pipelines", &report, self.json),
            None => {
                println!("pipelines disabled; nothing to do");
                Ok(())
            }
        }
    }
}

pub fn reconcile() -> Result<()> {
    let engine = super::engine()?;
    let report = engine.reconcile().context("reconcile failed")?;
    println!(
        "✓ checked {} build(s): {} updated, {} aborted, {} errored, {} poll failure(s)",
        report.checked, report.updated, report.aborted, report.errored, report.failed
    );
    Ok(())
}

fn sites_or_all(engine: &Engine, sites: Vec<String>) -> Result<Vec<String>> {
    if !sites.is_empty() {
        return Ok(sites);
    }
    engine.site_names().context("failed to list sites")
}

/// Print the report; a partial failure exits non-zero.
fn finish_batch(what: &str, report: &BatchReport, json: bool) -> Result<()> {
    if json {
        super::print_json(report)?;
    } else {
        println!(
            "{what}: {} succeeded, {} failed in {} chunk(s)",
            report.succeeded.len().to_string().green(),
            report.failed.len().to_string().red(),
            report.chunks
        );
        for failure in &report.failed {
            println!("  {} {}: {}", "✗".red(), failure.site, failure.error);
        }
        if let Some(id) = &report.mass_build {
            println!("  mass build {id} triggered");
        }
        if let Some(error) = &report.mass_build_error {
            println!("  {} mass build: {error}", "✗".red());
        }
    }
    if report.outcome() == BatchOutcome::PartialFailure {
        bail!("{what} finished with failures");
    }
    Ok(())
}
