//! `sitesync diff <site>` — unified diffs of what sync would push.

use anyhow::{Context, Result};
use clap::Args;

#[derive(Args, Debug)]
pub struct DiffArgs {
    pub site: String,
}

impl DiffArgs {
    pub fn run(self) -> Result<()> {
        let engine = super::engine()?;
        let diffs = engine
            .diff(&self.site)
            .with_context(|| format!("diff failed for '{}'", self.site))?;

        if diffs.is_empty() {
            println!("No differences for '{}'.", self.site);
            return Ok(());
        }

        for diff in diffs {
            print!("{}", diff.unified_diff);
            if !diff.unified_diff.ends_with('\n') {
                println!();
            }
        }
        Ok(())
    }
}
