use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use conserve_core::{Archive, BandId, Kind};

#[derive(Args)]
pub struct LsCommand {
    #[arg(help = "Archive to read")]
    archive: PathBuf,

    #[arg(long, help = "Band to list, by default the latest complete band")]
    band: Option<BandId>,

    #[arg(short, long, help = "Show kind, size and modification time")]
    long: bool,
}

impl LsCommand {
    pub async fn run(&self) -> Result<()> {
        let archive = Archive::open(&self.archive).await?;
        let band = archive.select_band(self.band).await?;
        let mut reader = band.open_index_reader().await?;
        while let Some(entry) = reader.next_entry().await? {
            if self.long {
                let mtime = chrono::DateTime::from_timestamp(entry.mtime, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                let detail = match (&entry.kind, &entry.target) {
                    (Kind::Symlink, Some(target)) => format!(" -> {}", target),
                    _ => String::new(),
                };
                println!(
                    "{:<8} {:>12} {:<19} {}{}",
                    entry.kind, entry.size, mtime, entry.apath, detail
                );
            } else {
                println!("{}", entry.apath);
            }
        }
        Ok(())
    }
}
