use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::band::{Band, read_json};
use crate::block_store::{BLOCK_DIR, BlockStore};
use crate::io::{exists, write_durable};
use crate::{BandId, Error, Result};

/// Name of the marker file identifying an archive directory.
pub const ARCHIVE_MARKER_FILENAME: &str = "CONSERVE";

pub const ARCHIVE_FORMAT_VERSION: u32 = 1;

/// The only supported content hash.
pub const HASH_ALGORITHM: &str = "blake3";

/// Contents of the archive marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub format_version: u32,
    pub id: String,
    pub hash_algorithm: String,
    pub created: DateTime<Utc>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            format_version: ARCHIVE_FORMAT_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            hash_algorithm: HASH_ALGORITHM.to_string(),
            created: Utc::now(),
        }
    }
}

/// A backup archive: a directory of bands sharing one block store.
///
/// # Archive Structure
///
/// ```text
/// archive/
/// ├── CONSERVE     # Archive marker and format version
/// ├── d/           # Content-addressed blocks
/// ├── b0000/       # First band
/// └── b0001/       # ...
/// ```
///
/// One writer at a time is assumed. Two processes backing up into the same
/// archive at once may both choose the same next band id, in which case the
/// slower one fails with [`Error::BandExists`].
///
/// # Examples
///
/// ```no_run
/// use conserve_core::Archive;
///
/// #[tokio::main]
/// async fn main() -> conserve_core::Result<()> {
///     let archive = Archive::create("./backup-archive").await?;
///     assert!(archive.list_bands().await?.is_empty());
///
///     let archive = Archive::open("./backup-archive").await?;
///     println!("next band: {}", archive.next_band_id().await?);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Archive {
    path: PathBuf,
    config: ArchiveConfig,
    block_store: BlockStore,
}

impl Archive {
    /// Create a new, empty archive at `path`.
    ///
    /// The directory may be absent or empty. Anything else, including an
    /// existing archive, fails without changing the directory.
    pub async fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if exists(&path).await? {
            if exists(&path.join(ARCHIVE_MARKER_FILENAME)).await? {
                return Err(Error::ArchiveExists { path });
            }
            let mut entries = fs::read_dir(&path)
                .await
                .map_err(|e| Error::io_path(&path, e))?;
            if entries.next_entry().await?.is_some() {
                return Err(Error::DirectoryNotEmpty { path });
            }
        } else {
            fs::create_dir(&path)
                .await
                .map_err(|e| Error::io_path(&path, e))?;
        }

        let block_store = BlockStore::create(path.join(BLOCK_DIR)).await?;
        let config = ArchiveConfig::default();
        let json = serde_json::to_vec_pretty(&config)?;
        // The marker goes last so a half-created archive is not mistaken
        // for a usable one.
        write_durable(&path.join(ARCHIVE_MARKER_FILENAME), &json).await?;
        info!(path = %path.display(), id = %config.id, "Created archive");

        Ok(Self {
            path,
            config,
            block_store,
        })
    }

    /// Open an existing archive.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !exists(&path).await? {
            return Err(Error::ArchiveNotFound { path });
        }
        let marker = path.join(ARCHIVE_MARKER_FILENAME);
        if !exists(&marker).await? {
            return Err(Error::invalid_format(&path, "no archive marker"));
        }
        let config: ArchiveConfig = read_json(&marker).await?;
        if config.format_version != ARCHIVE_FORMAT_VERSION {
            return Err(Error::invalid_format(
                &marker,
                format!("unsupported archive format version {}", config.format_version),
            ));
        }
        if config.hash_algorithm != HASH_ALGORITHM {
            return Err(Error::invalid_format(
                &marker,
                format!("unsupported hash algorithm {:?}", config.hash_algorithm),
            ));
        }
        debug!(path = %path.display(), id = %config.id, "Opened archive");

        let block_store = BlockStore::new(path.join(BLOCK_DIR));
        Ok(Self {
            path,
            config,
            block_store,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn block_store(&self) -> &BlockStore {
        &self.block_store
    }

    /// All band ids, in increasing order.
    ///
    /// Only directory names are read, not band contents.
    pub async fn list_bands(&self) -> Result<Vec<BandId>> {
        let mut entries = fs::read_dir(&self.path)
            .await
            .map_err(|e| Error::io_path(&self.path, e))?;
        let mut band_ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                warn!(path = %entry.path().display(), "Unexpected file in archive");
                continue;
            };
            if let Some(band_id) = BandId::from_dir_name(name) {
                if entry.file_type().await?.is_dir() {
                    band_ids.push(band_id);
                    continue;
                }
            }
            if name != ARCHIVE_MARKER_FILENAME && name != BLOCK_DIR {
                warn!(name, "Unexpected file in archive");
            }
        }

        band_ids.sort();
        Ok(band_ids)
    }

    /// The id the next band will get: one more than the highest existing
    /// band, or zero for an empty archive.
    ///
    /// Always recomputed from the directory, never cached.
    pub async fn next_band_id(&self) -> Result<BandId> {
        Ok(self
            .list_bands()
            .await?
            .last()
            .map(BandId::next)
            .unwrap_or(BandId::ZERO))
    }

    /// Allocate and create a new band.
    pub async fn create_band(&self, source: Option<&Path>) -> Result<Band> {
        let id = self.next_band_id().await?;
        Band::create(self, id, source).await
    }

    pub async fn open_band(&self, id: BandId) -> Result<Band> {
        Band::open(self, id).await
    }

    /// The most recent band that finished successfully.
    pub async fn last_complete_band(&self) -> Result<Option<Band>> {
        for id in self.list_bands().await?.into_iter().rev() {
            let band = self.open_band(id).await?;
            if band.is_complete().await? {
                return Ok(Some(band));
            }
        }
        Ok(None)
    }

    /// All complete bands, oldest first. Incomplete bands are skipped.
    pub async fn list_complete_bands(&self) -> Result<Vec<BandId>> {
        let mut complete = Vec::new();
        for id in self.list_bands().await? {
            if self.open_band(id).await?.is_complete().await? {
                complete.push(id);
            }
        }
        Ok(complete)
    }

    /// Open `id` if given, otherwise the latest complete band.
    pub async fn select_band(&self, id: Option<BandId>) -> Result<Band> {
        match id {
            Some(id) => self.open_band(id).await,
            None => self.last_complete_band().await?.ok_or(Error::NoCompleteBand),
        }
    }
}
