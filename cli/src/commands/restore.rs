use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use conserve_core::{Archive, BandId, restore};
use tracing::info;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(help = "Archive to restore from")]
    archive: PathBuf,

    #[arg(help = "Destination directory, which must be empty or absent")]
    destination: PathBuf,

    #[arg(long, help = "Band to restore, by default the latest complete band")]
    band: Option<BandId>,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let archive = Archive::open(&self.archive).await?;
        info!(destination = %self.destination.display(), "Starting restore");
        let stats = restore(&archive, self.band, &self.destination).await?;
        if !cli.quiet {
            println!(
                "Restored {} files, {} directories, {} symlinks ({} bytes)",
                stats.files, stats.directories, stats.symlinks, stats.bytes
            );
            if stats.skipped_special > 0 {
                println!("Skipped {} special files", stats.skipped_special);
            }
        }
        Ok(())
    }
}
