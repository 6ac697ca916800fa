use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use conserve_core::Archive;
use tracing::info;

#[derive(Args)]
pub struct InitCommand {
    #[arg(help = "Directory for the new archive")]
    archive: PathBuf,
}

impl InitCommand {
    pub async fn run(&self) -> Result<()> {
        info!("Initializing archive at: {}", self.archive.display());
        let archive = Archive::create(&self.archive)
            .await
            .with_context(|| format!("Failed to create archive {}", self.archive.display()))?;
        println!("Created new archive in {}", archive.path().display());
        Ok(())
    }
}
