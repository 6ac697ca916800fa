use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use conserve_core::{
    Archive, BackupMonitor, BackupOptions, BackupStats, IndexEntry, backup, stats::mb,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::config::Config;
use crate::retry::{RetryConfig, retry_with_backoff};

#[derive(Args)]
pub struct BackupCommand {
    #[arg(help = "Directory to back up")]
    source: PathBuf,

    #[arg(help = "Archive to write into")]
    archive: PathBuf,

    #[arg(long, help = "Block size in bytes")]
    block_size: Option<usize>,

    #[arg(short, long, help = "Number of files to process concurrently")]
    jobs: Option<usize>,

    #[arg(long, help = "Retry a backup that fails with an I/O error this many times")]
    retries: Option<u32>,
}

/// Shows backup progress on a spinner.
struct ProgressMonitor {
    bar: ProgressBar,
}

impl BackupMonitor for ProgressMonitor {
    fn entry_added(&self, entry: &IndexEntry, stats: &BackupStats) {
        self.bar.set_message(format!(
            "{} entries, {} MB: {}",
            stats.entries(),
            mb(stats.source_bytes),
            entry.apath
        ));
        self.bar.tick();
    }
}

impl BackupCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &Config) -> Result<()> {
        let options = self.options(config)?;
        let retry = RetryConfig::with_retries(self.retries.unwrap_or(config.backup.retries));

        info!("Opening archive at: {}", self.archive.display());
        let archive = Archive::open(&self.archive).await?;

        let bar = if cli.quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        bar.set_style(ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {wide_msg}",
        )?);
        let monitor = ProgressMonitor { bar };

        let archive = &archive;
        let source = self.source.as_path();
        let options = &options;
        let monitor_ref: &dyn BackupMonitor = &monitor;
        let outcome = retry_with_backoff(&retry, "backup", move || {
            backup(archive, source, options, monitor_ref)
        })
        .await;
        monitor.bar.finish_and_clear();
        let outcome = outcome?;

        if !cli.quiet {
            println!("Backup complete: band {}", outcome.band_id.dir_name());
            println!("{}", outcome.stats);
        }
        Ok(())
    }

    fn options(&self, config: &Config) -> Result<BackupOptions> {
        let mut options = BackupOptions::default();
        if let Some(block_size) = self.block_size.or(config.backup.block_size) {
            if block_size == 0 {
                bail!("Block size must be positive");
            }
            options.block_size = block_size;
        }
        if let Some(jobs) = self.jobs.or(config.backup.jobs) {
            options.jobs = jobs.max(1);
        }
        Ok(options)
    }
}
