pub mod apath;
pub mod archive;
pub mod backup;
pub mod band;
pub mod block_store;
pub mod chunker;
pub mod error;
pub mod index;
pub mod inspect;
mod io;
pub mod restore;
pub mod stats;
pub mod types;
pub mod validate;

pub use apath::Apath;
pub use archive::{Archive, ArchiveConfig};
pub use backup::{BackupMonitor, BackupOptions, BackupOutcome, NullMonitor, backup};
pub use band::{Band, BandHead, BandInfo, BandTail};
pub use block_store::{BlockStore, PutOutcome};
pub use chunker::{Chunker, DEFAULT_BLOCK_SIZE};
pub use error::{Error, Result};
pub use index::{IndexEntry, IndexReader, IndexWriter};
pub use inspect::{Record, inspect};
pub use restore::restore;
pub use stats::{BackupStats, RestoreStats, ValidateStats};
pub use types::*;
pub use validate::validate;
