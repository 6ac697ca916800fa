use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{Apath, BandId, BlockHash};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error on {}: {source}", .path.display())]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Archive already exists at {}", .path.display())]
    ArchiveExists { path: PathBuf },

    #[error("Directory is not empty, refusing to create an archive at {}", .path.display())]
    DirectoryNotEmpty { path: PathBuf },

    #[error("Band {band_id} already exists")]
    BandExists { band_id: BandId },

    #[error("Archive not found at {}", .path.display())]
    ArchiveNotFound { path: PathBuf },

    #[error("Band not found: {band_id}")]
    BandNotFound { band_id: BandId },

    #[error("Block not found: {hash}")]
    BlockNotFound { hash: BlockHash },

    #[error("No complete band in archive")]
    NoCompleteBand,

    #[error("Invalid format in {}: {reason}", .path.display())]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("Block {hash} is corrupt: {reason}")]
    Integrity { hash: BlockHash, reason: String },

    #[error("Band {band_id} is incomplete")]
    IncompleteBand { band_id: BandId },

    #[error("Index {} ends after {entries_read} entries without a trailer", .path.display())]
    TruncatedIndex { path: PathBuf, entries_read: u64 },

    #[error("Index record of {len} bytes is too large for {}", .path.display())]
    IndexRecordTooLarge { path: PathBuf, len: usize },

    #[error("Index entry {apath} is not after previous entry {previous}")]
    UnorderedIndex { previous: Apath, apath: Apath },

    #[error("Unsupported path {}: {reason}", .path.display())]
    UnsupportedPath { path: PathBuf, reason: String },

    #[error("Source directory not found: {}", .path.display())]
    SourceNotFound { path: PathBuf },

    #[error("Restore destination {} is not empty", .path.display())]
    DestinationNotEmpty { path: PathBuf },
}

impl Error {
    pub(crate) fn io_path(path: &Path, source: std::io::Error) -> Error {
        Error::IoPath {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn invalid_format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Error {
        Error::InvalidFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for failures of the underlying storage, as opposed to format or
    /// integrity problems that would recur on every attempt.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_) | Error::IoPath { .. })
    }

    /// True for any of the not-found variants.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ArchiveNotFound { .. }
                | Error::BandNotFound { .. }
                | Error::BlockNotFound { .. }
                | Error::SourceNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
