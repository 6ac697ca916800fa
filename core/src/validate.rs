//! Whole-archive consistency check.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::stats::ValidateStats;
use crate::{Archive, BlockHash, Result};

/// Check every stored block, then check that each complete band's index
/// reads cleanly and refers only to stored blocks.
///
/// Problems found in the archive are counted in the returned stats; only
/// failures to list the archive itself are returned as errors.
pub async fn validate(archive: &Archive) -> Result<ValidateStats> {
    let store = archive.block_store();
    let mut stats = store.validate().await?;
    let present: HashSet<BlockHash> = store.block_names().await?.into_iter().collect();
    info!(blocks = stats.blocks, "Checked blocks");

    for band_id in archive.list_bands().await? {
        stats.bands += 1;
        let band = archive.open_band(band_id).await?;
        if !band.is_complete().await? {
            info!(band = %band_id, "Band is incomplete");
            stats.incomplete_bands += 1;
            continue;
        }
        let mut reader = match band.open_index_reader().await {
            Ok(reader) => reader,
            Err(e) => {
                warn!(band = %band_id, error = %e, "Can't open index");
                stats.bad_indexes += 1;
                continue;
            }
        };
        loop {
            match reader.next_entry().await {
                Ok(Some(entry)) => {
                    for hash in &entry.blocks {
                        if !present.contains(hash) {
                            warn!(band = %band_id, apath = %entry.apath, block = %hash, "Missing block");
                            stats.missing_blocks += 1;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(band = %band_id, error = %e, "Bad index");
                    stats.bad_indexes += 1;
                    break;
                }
            }
        }
    }
    Ok(stats)
}
