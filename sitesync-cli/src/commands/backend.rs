//! `sitesync backend create <site>`

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

#[derive(Subcommand, Debug)]
pub enum BackendCommand {
    /// Create the site's repository and branches if missing.
    Create(CreateArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    pub site: String,
}

pub fn run(cmd: BackendCommand) -> Result<()> {
    match cmd {
        BackendCommand::Create(args) => {
            let engine = super::engine()?;
            match engine
                .create_backend(&args.site)
                .with_context(|| format!("backend create failed for '{}'", args.site))?
            {
                Some(()) => println!("✓ Backend ready for '{}'", args.site),
                None => println!("backend sync disabled; nothing to do"),
            }
            Ok(())
        }
    }
}
