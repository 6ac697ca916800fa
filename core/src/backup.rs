//! Make a backup: walk a source tree and write a new band.
//!
//! The tree is walked on a blocking thread in apath order. Files are chunked,
//! hashed and stored on worker tasks, several at a time, and the finished
//! entries are put back into walk order before they reach the index. Only
//! once the index is finished is the band marked complete, so an error at
//! any point leaves an incomplete band and possibly some unreferenced blocks,
//! both harmless.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::block_store::{BlockStore, PutOutcome};
use crate::chunker::{Chunker, DEFAULT_BLOCK_SIZE};
use crate::index::IndexEntry;
use crate::stats::BackupStats;
use crate::{Apath, Archive, BandId, BlockHash, Error, Kind, Result};

/// Walked entries buffered ahead of the workers.
const WALK_QUEUE_LEN: usize = 256;

#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Files are split into blocks of this many bytes.
    pub block_size: usize,
    /// Number of files processed concurrently.
    pub jobs: usize,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Receives each entry as it is added to the index, in index order.
pub trait BackupMonitor: Send + Sync {
    fn entry_added(&self, _entry: &IndexEntry, _stats: &BackupStats) {}
}

/// A monitor that ignores everything.
pub struct NullMonitor;

impl BackupMonitor for NullMonitor {}

/// Result of a successful backup.
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub band_id: BandId,
    pub entry_count: u64,
    pub stats: BackupStats,
}

/// One item from the source walk.
#[derive(Debug)]
struct SourceEntry {
    path: PathBuf,
    apath: Apath,
    kind: Kind,
    metadata: Metadata,
    target: Option<String>,
}

/// Back up `source` into a new band of `archive`.
pub async fn backup(
    archive: &Archive,
    source: &Path,
    options: &BackupOptions,
    monitor: &dyn BackupMonitor,
) -> Result<BackupOutcome> {
    let source = match tokio::fs::canonicalize(source).await {
        Ok(path) => path,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::SourceNotFound {
                path: source.to_path_buf(),
            });
        }
        Err(e) => return Err(Error::io_path(source, e)),
    };
    if !tokio::fs::metadata(&source)
        .await
        .map_err(|e| Error::io_path(&source, e))?
        .is_dir()
    {
        return Err(Error::UnsupportedPath {
            path: source,
            reason: "backup source is not a directory".to_string(),
        });
    }

    let band = archive.create_band(Some(&source)).await?;
    info!(band = %band.id(), source = %source.display(), "Starting backup");

    let mut index_writer = band.open_index_writer().await?;
    let chunker = Chunker::new(options.block_size);
    let store = archive.block_store().clone();
    let mut stats = BackupStats::default();

    let walked = Box::pin(walk_source(source));
    let mut entries = walked
        .map(|source_entry| {
            let store = store.clone();
            async move {
                let source_entry = source_entry?;
                let task = tokio::spawn(process_entry(store, chunker, source_entry));
                let mut task = AbortOnDrop(task);
                match (&mut task.0).await {
                    Ok(result) => result,
                    Err(join_error) => Err(Error::Io(std::io::Error::other(join_error))),
                }
            }
        })
        .buffered(options.jobs.max(1));

    while let Some(result) = entries.next().await {
        let (entry, entry_stats) = result?;
        index_writer.push(&entry).await?;
        stats += entry_stats;
        monitor.entry_added(&entry, &stats);
    }
    drop(entries);

    let entry_count = index_writer.finish().await?;
    band.mark_complete(entry_count, stats.clone()).await?;
    info!(
        band = %band.id(),
        entries = entry_count,
        blocks_written = stats.blocks_written,
        blocks_deduplicated = stats.blocks_deduplicated,
        "Backup complete"
    );
    Ok(BackupOutcome {
        band_id: band.id(),
        entry_count,
        stats,
    })
}

/// Cancels a worker task when dropped, so that no blocks are still being
/// written after a failed backup returns.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Walk `root` on a blocking thread, yielding entries in apath order.
fn walk_source(root: PathBuf) -> impl futures::Stream<Item = Result<SourceEntry>> {
    let (tx, rx) = mpsc::channel(WALK_QUEUE_LEN);
    tokio::task::spawn_blocking(move || {
        let walker = WalkDir::new(&root).follow_links(false).sort_by_file_name();
        for item in walker {
            let result = item
                .map_err(|e| {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    Error::IoPath {
                        path,
                        source: e.into(),
                    }
                })
                .and_then(|dir_entry| source_entry(&root, dir_entry));
            let failed = result.is_err();
            // A closed channel means the backup was abandoned.
            if tx.blocking_send(result).is_err() || failed {
                break;
            }
        }
    });
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

fn source_entry(root: &Path, dir_entry: walkdir::DirEntry) -> Result<SourceEntry> {
    let path = dir_entry.into_path();
    let apath = Apath::from_relative(root, &path)?;
    let metadata = std::fs::symlink_metadata(&path).map_err(|e| Error::io_path(&path, e))?;
    let kind = Kind::from(metadata.file_type());
    let target = if kind.is_symlink() {
        let target = std::fs::read_link(&path).map_err(|e| Error::io_path(&path, e))?;
        let target = target.into_os_string().into_string().map_err(|_| Error::UnsupportedPath {
            path: path.clone(),
            reason: "symlink target is not valid UTF-8".to_string(),
        })?;
        Some(target)
    } else {
        None
    };
    Ok(SourceEntry {
        path,
        apath,
        kind,
        metadata,
        target,
    })
}

async fn process_entry(
    store: BlockStore,
    chunker: Chunker,
    source_entry: SourceEntry,
) -> Result<(IndexEntry, BackupStats)> {
    let mut stats = BackupStats::default();
    let mut entry = IndexEntry {
        apath: source_entry.apath,
        kind: source_entry.kind,
        size: 0,
        mtime: unix_mtime(&source_entry.metadata),
        unix_mode: unix_mode(&source_entry.metadata),
        target: source_entry.target,
        blocks: Vec::new(),
    };
    match entry.kind {
        Kind::Dir => stats.directories += 1,
        Kind::Symlink => stats.symlinks += 1,
        Kind::Special => {
            warn!(apath = %entry.apath, "Recording special file without content");
            stats.special += 1;
        }
        Kind::File => {
            let (blocks, size) =
                store_file_content(&store, chunker, &source_entry.path, &mut stats).await?;
            entry.blocks = blocks;
            entry.size = size;
            stats.files += 1;
            if size == 0 {
                stats.empty_files += 1;
            }
        }
    }
    Ok((entry, stats))
}

/// Chunk one file into the block store, returning its block hashes and
/// length.
async fn store_file_content(
    store: &BlockStore,
    chunker: Chunker,
    path: &Path,
    stats: &mut BackupStats,
) -> Result<(Vec<BlockHash>, u64)> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::io_path(path, e))?;
    let mut reader = chunker.reader(file);
    let mut blocks = Vec::new();
    let mut size = 0u64;
    while let Some(chunk) = reader
        .next_chunk()
        .await
        .map_err(|e| Error::io_path(path, e))?
    {
        let hash = BlockHash::of(chunk);
        size += chunk.len() as u64;
        stats.source_bytes += chunk.len() as u64;
        if store.has(&hash).await? {
            stats.blocks_deduplicated += 1;
        } else {
            match store.put(&hash, chunk).await? {
                PutOutcome::Written { compressed_len } => {
                    stats.blocks_written += 1;
                    stats.written_bytes += chunk.len() as u64;
                    stats.compressed_bytes += compressed_len;
                }
                PutOutcome::AlreadyPresent => stats.blocks_deduplicated += 1,
            }
        }
        blocks.push(hash);
    }
    debug!(path = %path.display(), blocks = blocks.len(), size, "Stored file");
    Ok((blocks, size))
}

fn unix_mtime(metadata: &Metadata) -> i64 {
    match metadata.modified() {
        Ok(time) => match time.duration_since(UNIX_EPOCH) {
            Ok(after) => after.as_secs() as i64,
            Err(before) => -(before.duration().as_secs() as i64),
        },
        Err(_) => 0,
    }
}

#[cfg(unix)]
fn unix_mode(metadata: &Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn unix_mode(_metadata: &Metadata) -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Archive, PathBuf) {
        let dir = TempDir::new().unwrap();
        let archive = Archive::create(dir.path().join("archive")).await.unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir(&source).unwrap();
        (dir, archive, source)
    }

    fn small_options() -> BackupOptions {
        BackupOptions {
            block_size: 1024,
            jobs: 4,
        }
    }

    #[tokio::test]
    async fn test_backup_records_entries_in_order() {
        let (_dir, archive, source) = setup().await;
        std::fs::create_dir(source.join("sub")).unwrap();
        std::fs::write(source.join("sub").join("inner"), b"inner").unwrap();
        std::fs::write(source.join("a.txt"), b"hello").unwrap();
        std::fs::write(source.join("zzz"), b"").unwrap();

        let outcome = backup(&archive, &source, &small_options(), &NullMonitor)
            .await
            .unwrap();
        assert_eq!(outcome.band_id, BandId::ZERO);
        assert_eq!(outcome.entry_count, 5);
        assert_eq!(outcome.stats.files, 3);
        assert_eq!(outcome.stats.directories, 2);
        assert_eq!(outcome.stats.empty_files, 1);

        let band = archive.open_band(outcome.band_id).await.unwrap();
        let entries = band.open_index_reader().await.unwrap().read_all().await.unwrap();
        let apaths: Vec<&str> = entries.iter().map(|e| e.apath.as_str()).collect();
        assert_eq!(apaths, vec!["/", "/a.txt", "/sub", "/sub/inner", "/zzz"]);
        assert_eq!(entries[1].size, 5);
        assert_eq!(entries[1].blocks, vec![BlockHash::of(b"hello")]);
        assert!(entries[4].blocks.is_empty());
    }

    #[tokio::test]
    async fn test_missing_source() {
        let (dir, archive, _source) = setup().await;
        let err = backup(&archive, &dir.path().join("nope"), &small_options(), &NullMonitor)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SourceNotFound { .. }));
        assert!(archive.list_bands().await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_not_followed() {
        let (_dir, archive, source) = setup().await;
        std::fs::write(source.join("target"), b"data").unwrap();
        std::os::unix::fs::symlink("target", source.join("link")).unwrap();

        let outcome = backup(&archive, &source, &small_options(), &NullMonitor)
            .await
            .unwrap();
        assert_eq!(outcome.stats.symlinks, 1);
        let band = archive.open_band(outcome.band_id).await.unwrap();
        let entries = band.open_index_reader().await.unwrap().read_all().await.unwrap();
        let link = entries.iter().find(|e| e.apath.as_str() == "/link").unwrap();
        assert_eq!(link.kind, Kind::Symlink);
        assert_eq!(link.target.as_deref(), Some("target"));
        assert!(link.blocks.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fifo_recorded_as_special() {
        let (_dir, archive, source) = setup().await;
        let fifo = source.join("pipe");
        let status = std::process::Command::new("mkfifo").arg(&fifo).status();
        if !matches!(status, Ok(s) if s.success()) {
            return;
        }
        let outcome = backup(&archive, &source, &small_options(), &NullMonitor)
            .await
            .unwrap();
        assert_eq!(outcome.stats.special, 1);
        let band = archive.open_band(outcome.band_id).await.unwrap();
        let entries = band.open_index_reader().await.unwrap().read_all().await.unwrap();
        assert_eq!(entries[1].kind, Kind::Special);
        assert!(entries[1].blocks.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_worker_is_cancelled() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let guard = AbortOnDrop(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        }));
        drop(guard);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_entry_stops_backup_without_tail() {
        let (_dir, archive, source) = setup().await;
        std::fs::write(source.join("one"), vec![1u8; 3000]).unwrap();
        std::fs::write(source.join("two"), vec![2u8; 3000]).unwrap();
        // A plain file where the block store expects its directory.
        let blocks = archive.block_store().path().to_path_buf();
        std::fs::remove_dir_all(&blocks).unwrap();
        std::fs::write(&blocks, b"").unwrap();

        let err = backup(&archive, &source, &small_options(), &NullMonitor)
            .await
            .err()
            .unwrap();
        assert!(err.is_io(), "{err}");
        let band = archive.open_band(BandId::new(0)).await.unwrap();
        assert!(!band.is_complete().await.unwrap());
    }
}
