//! A band is one backup generation: a numbered directory holding the index
//! of everything in that backup.
//!
//! ```text
//! b0000/
//! ├── BANDHEAD   # written when the band is created
//! ├── index      # entries, streamed during the backup
//! └── BANDTAIL   # completion marker, written last
//! ```
//!
//! A band without a tail was interrupted. It can still be inspected but is
//! never used as a restore point.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::info;

use crate::index::{INDEX_FILENAME, IndexReader, IndexWriter};
use crate::io::{exists, sync_dir, write_durable};
use crate::stats::BackupStats;
use crate::{Archive, BandId, Error, Result};

pub const BAND_HEAD_FILENAME: &str = "BANDHEAD";

pub const BAND_TAIL_FILENAME: &str = "BANDTAIL";

pub const BAND_FORMAT_VERSION: u32 = 1;

/// Metadata written when a band is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandHead {
    pub format_version: u32,
    pub band_id: BandId,
    pub start_time: DateTime<Utc>,
    pub source: Option<PathBuf>,
    pub hostname: String,
    pub username: String,
}

/// Metadata written as the last step of a successful backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandTail {
    pub format_version: u32,
    pub end_time: DateTime<Utc>,
    pub entry_count: u64,
    pub stats: BackupStats,
}

/// Head and (if complete) tail of a band, for listings.
///
/// The head is missing only if a backup stopped between creating the band
/// directory and writing `BANDHEAD`.
#[derive(Debug, Clone, Serialize)]
pub struct BandInfo {
    pub id: BandId,
    pub head: Option<BandHead>,
    pub tail: Option<BandTail>,
}

impl BandInfo {
    pub fn is_complete(&self) -> bool {
        self.tail.is_some()
    }

    /// Wall-clock duration of a completed backup.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (&self.head, &self.tail) {
            (Some(head), Some(tail)) => Some(tail.end_time - head.start_time),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Band {
    id: BandId,
    path: PathBuf,
}

impl Band {
    /// Create the directory and head for a new band.
    ///
    /// Fails with [`Error::BandExists`] if the directory is already there,
    /// for example because another process allocated the same id.
    pub async fn create(archive: &Archive, id: BandId, source: Option<&Path>) -> Result<Band> {
        let path = archive.path().join(id.dir_name());
        match fs::create_dir(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::BandExists { band_id: id });
            }
            Err(e) => return Err(Error::io_path(&path, e)),
        }
        sync_dir(archive.path()).await?;

        let head = BandHead {
            format_version: BAND_FORMAT_VERSION,
            band_id: id,
            start_time: Utc::now(),
            source: source.map(Path::to_path_buf),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            username: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "unknown".to_string()),
        };
        let json = serde_json::to_vec_pretty(&head)?;
        write_durable(&path.join(BAND_HEAD_FILENAME), &json).await?;
        info!(band = %id, "Created band");
        Ok(Band { id, path })
    }

    /// Open an existing band.
    pub async fn open(archive: &Archive, id: BandId) -> Result<Band> {
        let path = archive.path().join(id.dir_name());
        if !exists(&path).await? {
            return Err(Error::BandNotFound { band_id: id });
        }
        Ok(Band { id, path })
    }

    pub fn id(&self) -> BandId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index_path(&self) -> PathBuf {
        self.path.join(INDEX_FILENAME)
    }

    pub async fn head(&self) -> Result<BandHead> {
        let head: BandHead = read_json(&self.path.join(BAND_HEAD_FILENAME)).await?;
        check_version(&self.path.join(BAND_HEAD_FILENAME), head.format_version)?;
        Ok(head)
    }

    /// The band tail, or `None` if the band is incomplete.
    pub async fn tail(&self) -> Result<Option<BandTail>> {
        let path = self.path.join(BAND_TAIL_FILENAME);
        if !exists(&path).await? {
            return Ok(None);
        }
        let tail: BandTail = read_json(&path).await?;
        check_version(&path, tail.format_version)?;
        Ok(Some(tail))
    }

    pub async fn is_complete(&self) -> Result<bool> {
        exists(&self.path.join(BAND_TAIL_FILENAME)).await
    }

    pub async fn info(&self) -> Result<BandInfo> {
        let head = if exists(&self.path.join(BAND_HEAD_FILENAME)).await? {
            Some(self.head().await?)
        } else {
            None
        };
        Ok(BandInfo {
            id: self.id,
            head,
            tail: self.tail().await?,
        })
    }

    /// Start writing this band's index.
    pub async fn open_index_writer(&self) -> Result<IndexWriter> {
        IndexWriter::create(self.index_path()).await
    }

    /// Read the index of a complete band.
    pub async fn open_index_reader(&self) -> Result<IndexReader> {
        if !self.is_complete().await? {
            return Err(Error::IncompleteBand { band_id: self.id });
        }
        IndexReader::open(self.index_path()).await
    }

    /// Read the index whether or not the band is complete, for diagnostics.
    pub async fn open_index_reader_unchecked(&self) -> Result<IndexReader> {
        IndexReader::open(self.index_path()).await
    }

    /// Write the completion marker.
    ///
    /// Must be the last write of a backup, after the index is finished and
    /// every block it references is durable.
    pub async fn mark_complete(&self, entry_count: u64, stats: BackupStats) -> Result<BandTail> {
        let tail = BandTail {
            format_version: BAND_FORMAT_VERSION,
            end_time: Utc::now(),
            entry_count,
            stats,
        };
        let json = serde_json::to_vec_pretty(&tail)?;
        write_durable(&self.path.join(BAND_TAIL_FILENAME), &json).await?;
        info!(band = %self.id, entries = entry_count, "Band complete");
        Ok(tail)
    }
}

pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path).await.map_err(|e| Error::io_path(path, e))?;
    serde_json::from_slice(&data).map_err(|e| Error::invalid_format(path, e.to_string()))
}

fn check_version(path: &Path, version: u32) -> Result<()> {
    if version != BAND_FORMAT_VERSION {
        return Err(Error::invalid_format(
            path,
            format!("unsupported band format version {}", version),
        ));
    }
    Ok(())
}
