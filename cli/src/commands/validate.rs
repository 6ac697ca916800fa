use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use conserve_core::{Archive, validate};

#[derive(Args)]
pub struct ValidateCommand {
    #[arg(help = "Archive to check")]
    archive: PathBuf,
}

impl ValidateCommand {
    pub async fn run(&self) -> Result<()> {
        let archive = Archive::open(&self.archive).await?;
        let stats = validate(&archive).await?;
        println!("{:>12} blocks ({} bytes)", stats.blocks, stats.block_bytes);
        println!("{:>12} corrupt blocks", stats.corrupt_blocks);
        println!("{:>12} unreadable blocks", stats.unreadable_blocks);
        println!("{:>12} bands ({} incomplete)", stats.bands, stats.incomplete_bands);
        println!("{:>12} missing block references", stats.missing_blocks);
        println!("{:>12} damaged indexes", stats.bad_indexes);
        if stats.has_problems() {
            bail!("Archive {} has problems", self.archive.display());
        }
        Ok(())
    }
}
