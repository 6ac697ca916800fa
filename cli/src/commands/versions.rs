use std::fmt::Write;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, ValueEnum};
use conserve_core::{Archive, BandInfo};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Args)]
pub struct VersionsCommand {
    #[arg(help = "Archive to read")]
    archive: PathBuf,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table, help = "Output format")]
    format: OutputFormat,
}

impl VersionsCommand {
    pub async fn run(&self) -> Result<()> {
        let archive = Archive::open(&self.archive).await?;
        let bands = band_infos(&archive).await?;
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&bands)?),
            OutputFormat::Table => print!("{}", format_table(&bands)),
        }
        Ok(())
    }
}

/// Metadata for every band. Bands whose metadata can't be read are logged
/// and left out rather than hiding the rest of the archive.
async fn band_infos(archive: &Archive) -> Result<Vec<BandInfo>> {
    let mut bands = Vec::new();
    for id in archive.list_bands().await? {
        let info = match archive.open_band(id).await {
            Ok(band) => band.info().await,
            Err(e) => Err(e),
        };
        match info {
            Ok(info) => bands.push(info),
            Err(e) => warn!(band = %id, error = %e, "Can't read band metadata"),
        }
    }
    Ok(bands)
}

fn format_table(bands: &[BandInfo]) -> String {
    if bands.is_empty() {
        return "No bands found\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<8} {:<10} {:<20} {:>10} {:>8} Host",
        "Band", "Status", "Started", "Duration", "Entries"
    );
    let _ = writeln!(out, "{:-<80}", "");
    for info in bands {
        let status = if info.is_complete() {
            "complete"
        } else {
            "incomplete"
        };
        let started = info
            .head
            .as_ref()
            .map(|h| h.start_time.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let host = info
            .head
            .as_ref()
            .map(|h| h.hostname.as_str())
            .unwrap_or_default();
        let duration = info
            .duration()
            .map(|d| format!("{}s", d.num_seconds()))
            .unwrap_or_default();
        let entries = info
            .tail
            .as_ref()
            .map(|t| t.entry_count.to_string())
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "{:<8} {:<10} {:<20} {:>10} {:>8} {}",
            info.id.dir_name(),
            status,
            started,
            duration,
            entries,
            host
        );
    }
    out
}
