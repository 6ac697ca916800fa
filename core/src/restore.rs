//! Restore a complete band into a directory.

use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::block_store::BlockStore;
use crate::index::IndexEntry;
use crate::io::exists;
use crate::stats::RestoreStats;
use crate::{Archive, BandId, Error, Kind, Result};

/// Concatenate the blocks of a file entry into memory.
pub async fn read_entry_content(store: &BlockStore, entry: &IndexEntry) -> Result<Vec<u8>> {
    let mut content = Vec::with_capacity(entry.size as usize);
    for hash in &entry.blocks {
        content.extend_from_slice(&store.get(hash).await?);
    }
    Ok(content)
}

/// Restore band `band_id`, or the latest complete band, into `dest`.
///
/// `dest` must be absent or an empty directory. Special files are counted
/// and skipped.
pub async fn restore(
    archive: &Archive,
    band_id: Option<BandId>,
    dest: &Path,
) -> Result<RestoreStats> {
    let band = archive.select_band(band_id).await?;
    let mut reader = band.open_index_reader().await?;

    if exists(dest).await? {
        let mut entries = fs::read_dir(dest).await.map_err(|e| Error::io_path(dest, e))?;
        if entries.next_entry().await?.is_some() {
            return Err(Error::DestinationNotEmpty {
                path: dest.to_path_buf(),
            });
        }
    }

    let store = archive.block_store();
    let mut stats = RestoreStats::default();
    // Directory permissions are applied last, so read-only directories can
    // still be filled.
    let mut dir_modes = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let path = if entry.apath.is_root() {
            dest.to_path_buf()
        } else {
            dest.join(entry.apath.relative_path())
        };
        match entry.kind {
            Kind::Dir => {
                match fs::create_dir(&path).await {
                    Ok(()) => {}
                    Err(e)
                        if e.kind() == std::io::ErrorKind::AlreadyExists
                            && entry.apath.is_root() => {}
                    Err(e) => return Err(Error::io_path(&path, e)),
                }
                dir_modes.push((path, entry.unix_mode));
                stats.directories += 1;
            }
            Kind::File => {
                stats.bytes += restore_file(store, &entry, &path).await?;
                stats.files += 1;
            }
            Kind::Symlink => {
                restore_symlink(&entry, &path)?;
                stats.symlinks += 1;
            }
            Kind::Special => {
                warn!(apath = %entry.apath, "Skipping special file");
                stats.skipped_special += 1;
            }
        }
    }
    for (path, mode) in dir_modes.iter().rev() {
        set_mode(path, *mode).await?;
    }
    debug!(band = %band.id(), files = stats.files, "Restore complete");
    Ok(stats)
}

async fn restore_file(store: &BlockStore, entry: &IndexEntry, path: &Path) -> Result<u64> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| Error::io_path(path, e))?;
    let mut written = 0u64;
    for hash in &entry.blocks {
        let content = store.get(hash).await?;
        file.write_all(&content)
            .await
            .map_err(|e| Error::io_path(path, e))?;
        written += content.len() as u64;
    }
    if written != entry.size {
        return Err(Error::invalid_format(
            path,
            format!("index says {} bytes but blocks hold {}", entry.size, written),
        ));
    }
    file.flush().await.map_err(|e| Error::io_path(path, e))?;
    let file = file.into_std().await;
    if entry.mtime >= 0 {
        let mtime = UNIX_EPOCH + Duration::from_secs(entry.mtime as u64);
        file.set_modified(mtime).map_err(|e| Error::io_path(path, e))?;
    }
    drop(file);
    set_mode(path, entry.unix_mode).await?;
    Ok(written)
}

#[cfg(unix)]
fn restore_symlink(entry: &IndexEntry, path: &Path) -> Result<()> {
    let target = entry
        .target
        .as_deref()
        .ok_or_else(|| Error::invalid_format(path, "symlink entry has no target"))?;
    std::os::unix::fs::symlink(target, path).map_err(|e| Error::io_path(path, e))
}

#[cfg(not(unix))]
fn restore_symlink(entry: &IndexEntry, _path: &Path) -> Result<()> {
    warn!(apath = %entry.apath, "Symlinks are not restored on this platform");
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| Error::io_path(path, e))?;
    }
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupOptions, NullMonitor, backup};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_restore_reproduces_tree() {
        let dir = TempDir::new().unwrap();
        let archive = Archive::create(dir.path().join("archive")).await.unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir_all(source.join("sub")).unwrap();
        let big: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(source.join("big"), &big).unwrap();
        std::fs::write(source.join("sub").join("small"), b"small").unwrap();
        std::fs::write(source.join("empty"), b"").unwrap();

        let options = BackupOptions {
            block_size: 1000,
            jobs: 2,
        };
        backup(&archive, &source, &options, &NullMonitor).await.unwrap();

        let dest = dir.path().join("restored");
        let stats = restore(&archive, None, &dest).await.unwrap();
        assert_eq!(stats.files, 3);
        assert_eq!(stats.directories, 2);
        assert_eq!(stats.bytes, 10_005);
        assert_eq!(std::fs::read(dest.join("big")).unwrap(), big);
        assert_eq!(std::fs::read(dest.join("sub").join("small")).unwrap(), b"small");
        assert!(std::fs::read(dest.join("empty")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_refuses_nonempty_dest() {
        let dir = TempDir::new().unwrap();
        let archive = Archive::create(dir.path().join("archive")).await.unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir(&source).unwrap();
        backup(&archive, &source, &BackupOptions::default(), &NullMonitor)
            .await
            .unwrap();

        let dest = dir.path().join("dest");
        std::fs::create_dir(&dest).unwrap();
        std::fs::write(dest.join("existing"), b"x").unwrap();
        let err = restore(&archive, None, &dest).await.unwrap_err();
        assert!(matches!(err, Error::DestinationNotEmpty { .. }));
    }

    #[tokio::test]
    async fn test_restore_incomplete_band_fails() {
        let dir = TempDir::new().unwrap();
        let archive = Archive::create(dir.path().join("archive")).await.unwrap();
        let band = archive.create_band(None).await.unwrap();
        let err = restore(&archive, Some(band.id()), &dir.path().join("dest"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IncompleteBand { .. }));
    }
}
