use std::fmt::Write;
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use conserve_core::inspect;
use tracing::error;

#[derive(Args)]
pub struct PrintProtoCommand {
    #[arg(required = true, help = "Archive files to decode")]
    files: Vec<PathBuf>,
}

impl PrintProtoCommand {
    pub async fn run(&self) -> Result<()> {
        let (output, failures) = decode_files(&self.files).await?;
        print!("{output}");
        if failures > 0 {
            bail!("Failed to decode {failures} of {} files", self.files.len());
        }
        Ok(())
    }
}

/// Decodes each file in turn. A file that can't be decoded is logged and
/// skipped; the number of such files is returned with the output.
async fn decode_files(files: &[PathBuf]) -> Result<(String, usize)> {
    let mut out = String::new();
    let mut failures = 0;
    for path in files {
        match inspect(path).await {
            Ok(record) => {
                writeln!(out, "== {}", path.display())?;
                writeln!(out, "{}", serde_json::to_string_pretty(&record)?)?;
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to decode");
                failures += 1;
            }
        }
    }
    Ok((out, failures))
}
