//! Counters for interesting events during a backup, restore or validation.

use std::fmt;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

/// Counts from one backup run. Stored in the band tail of a completed band.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStats {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    /// Fifos, sockets and devices, recorded without content.
    pub special: u64,
    pub empty_files: u64,
    /// Uncompressed bytes read from source files.
    pub source_bytes: u64,
    pub blocks_written: u64,
    /// Chunks whose hash was already stored.
    pub blocks_deduplicated: u64,
    pub written_bytes: u64,
    pub compressed_bytes: u64,
}

impl BackupStats {
    pub fn entries(&self) -> u64 {
        self.files + self.directories + self.symlinks + self.special
    }

    /// Fraction of chunks that did not need to be stored.
    pub fn dedup_ratio(&self) -> f64 {
        let total = self.blocks_written + self.blocks_deduplicated;
        if total == 0 {
            0.0
        } else {
            self.blocks_deduplicated as f64 / total as f64
        }
    }
}

impl AddAssign for BackupStats {
    fn add_assign(&mut self, other: Self) {
        self.files += other.files;
        self.directories += other.directories;
        self.symlinks += other.symlinks;
        self.special += other.special;
        self.empty_files += other.empty_files;
        self.source_bytes += other.source_bytes;
        self.blocks_written += other.blocks_written;
        self.blocks_deduplicated += other.blocks_deduplicated;
        self.written_bytes += other.written_bytes;
        self.compressed_bytes += other.compressed_bytes;
    }
}

impl fmt::Display for BackupStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>12} files", self.files)?;
        writeln!(f, "{:>12} directories", self.directories)?;
        writeln!(f, "{:>12} symlinks", self.symlinks)?;
        writeln!(f, "{:>12} special entries", self.special)?;
        writeln!(f, "{:>12} MB source content", mb(self.source_bytes))?;
        writeln!(f, "{:>12} blocks written", self.blocks_written)?;
        writeln!(f, "{:>12} blocks deduplicated", self.blocks_deduplicated)?;
        write!(f, "{:>12} MB compressed data written", mb(self.compressed_bytes))
    }
}

/// Counts from checking blocks and band indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateStats {
    pub blocks: u64,
    pub block_bytes: u64,
    pub corrupt_blocks: u64,
    pub unreadable_blocks: u64,
    pub bands: u64,
    pub incomplete_bands: u64,
    /// References from complete indexes to blocks that are not stored.
    pub missing_blocks: u64,
    pub bad_indexes: u64,
}

impl ValidateStats {
    pub fn has_problems(&self) -> bool {
        self.corrupt_blocks > 0
            || self.unreadable_blocks > 0
            || self.missing_blocks > 0
            || self.bad_indexes > 0
    }
}

/// Counts from restoring a band.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub skipped_special: u64,
    pub bytes: u64,
}

/// Format a byte count as mebibytes.
pub fn mb(bytes: u64) -> String {
    format!("{:.2}", bytes as f64 / 1024.0 / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_assign_merges_counters() {
        let mut a = BackupStats {
            files: 1,
            blocks_written: 2,
            ..Default::default()
        };
        a += BackupStats {
            files: 3,
            blocks_deduplicated: 2,
            ..Default::default()
        };
        assert_eq!(a.files, 4);
        assert_eq!(a.blocks_written, 2);
        assert_eq!(a.blocks_deduplicated, 2);
        assert_eq!(a.dedup_ratio(), 0.5);
    }

    #[test]
    fn test_dedup_ratio_of_empty_run() {
        assert_eq!(BackupStats::default().dedup_ratio(), 0.0);
    }
}
