//! `sitesync status` — per-site sync and publish visibility.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use sitesync_core::{BuildStatus, FileStore, Version};
use sitesync_sync::status::{format_age, VersionStatus};
use sitesync_sync::{all_site_statuses, SiteStatus};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Filter to a single site.
    #[arg(long)]
    pub site: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let store = FileStore::open_at(&home).context("failed to open site store")?;
        let mut statuses = all_site_statuses(&store).context("failed to compute status")?;
        if let Some(filter) = &self.site {
            statuses.retain(|s| s.site.0 == *filter);
        }

        if self.json {
            return super::print_json(&StatusReportJson::new(&statuses));
        }
        print_table(&statuses);
        Ok(())
    }
}

#[derive(Serialize)]
struct StatusReportJson<'a> {
    summary: StatusSummaryJson,
    sites: &'a [SiteStatus],
}

#[derive(Serialize)]
struct StatusSummaryJson {
    sites: usize,
    pending_items: usize,
    unpublished_versions: usize,
}

impl<'a> StatusReportJson<'a> {
    fn new(sites: &'a [SiteStatus]) -> Self {
        Self {
            summary: StatusSummaryJson {
                sites: sites.len(),
                pending_items: sites.iter().map(|s| s.counts.pending()).sum(),
                unpublished_versions: unpublished_count(sites),
            },
            sites,
        }
    }
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "site")]
    site: String,
    #[tabled(rename = "new")]
    never_synced: usize,
    #[tabled(rename = "dirty")]
    dirty: usize,
    #[tabled(rename = "deleting")]
    pending_delete: usize,
    #[tabled(rename = "synced")]
    synced: usize,
    #[tabled(rename = "draft")]
    draft: String,
    #[tabled(rename = "live")]
    live: String,
    #[tabled(rename = "last publish")]
    last_published: String,
}

fn unpublished_count(sites: &[SiteStatus]) -> usize {
    sites
        .iter()
        .flat_map(|s| s.versions.iter())
        .filter(|v| v.has_unpublished_changes)
        .count()
}

fn print_table(sites: &[SiteStatus]) {
    let pending: usize = sites.iter().map(|s| s.counts.pending()).sum();
    println!(
        "sitesync v{} | {} sites | {} pending items | {} unpublished versions",
        env!("CARGO_PKG_VERSION"),
        sites.len(),
        pending,
        unpublished_count(sites),
    );

    if sites.is_empty() {
        println!("No sites registered.");
        return;
    }

    let now = Utc::now();
    let rows: Vec<StatusTableRow> = sites
        .iter()
        .map(|s| StatusTableRow {
            site: s.site.0.clone(),
            never_synced: s.counts.never_synced,
            dirty: s.counts.dirty,
            pending_delete: s.counts.pending_delete,
            synced: s.counts.synced,
            draft: version_cell(s, Version::Draft),
            live: version_cell(s, Version::Live),
            last_published: s
                .last_published_at
                .map(|at| format_age(at, now))
                .unwrap_or_else(|| "never".to_string()),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    if pending > 0 {
        println!("Run 'sitesync sync --all' to push pending content.");
    }
}

fn version_cell(site: &SiteStatus, version: Version) -> String {
    let Some(state) = site.versions.iter().find(|v| v.version == version) else {
        return "-".to_string();
    };
    let mut cell = format!("{} {}", status_indicator(state.status), state.status);
    if state.has_unpublished_changes {
        cell.push_str(" *");
    }
    if let Some(id) = unfinished_build(state) {
        cell.push_str(&format!(" #{id}"));
    }
    cell
}

fn unfinished_build(state: &VersionStatus) -> Option<&str> {
    state
        .build_id
        .as_deref()
        .filter(|_| state.status.is_in_flight())
}

fn status_indicator(status: BuildStatus) -> String {
    match status {
        BuildStatus::NotStarted => "■".bright_black().bold().to_string(),
        BuildStatus::Running => "■".yellow().bold().to_string(),
        BuildStatus::Succeeded => "■".green().bold().to_string(),
        BuildStatus::Failed | BuildStatus::Errored => "■".red().bold().to_string(),
        BuildStatus::Aborted => "■".magenta().bold().to_string(),
    }
}
