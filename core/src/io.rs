//! Durable file writes shared by the block store and band metadata.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::{Error, Result};

/// Temporary files in the archive have this prefix.
pub const TMP_PREFIX: &str = "tmp-";

/// Path for a fresh temporary file alongside `path`.
pub(crate) fn temp_path_for(path: &Path) -> PathBuf {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!("{}{}", TMP_PREFIX, uuid::Uuid::new_v4().simple()))
}

/// Write `data` into a new temporary file next to `path` and fsync it.
///
/// Returns the temporary path; the caller decides whether to rename it into
/// place or discard it.
pub(crate) async fn write_temp(path: &Path, data: &[u8]) -> Result<PathBuf> {
    let temp = temp_path_for(path);
    let mut file = fs::File::create(&temp)
        .await
        .map_err(|e| Error::io_path(&temp, e))?;
    let written = async {
        file.write_all(data).await?;
        file.sync_all().await
    }
    .await;
    if let Err(e) = written {
        let _ = fs::remove_file(&temp).await;
        return Err(Error::io_path(&temp, e));
    }
    Ok(temp)
}

/// Rename a synced temporary file into place and make the rename durable.
pub(crate) async fn persist(temp: &Path, path: &Path) -> Result<()> {
    if let Err(e) = fs::rename(temp, path).await {
        let _ = fs::remove_file(temp).await;
        return Err(Error::io_path(path, e));
    }
    if let Some(dir) = path.parent() {
        sync_dir(dir).await?;
    }
    Ok(())
}

/// Link a synced temporary file into place unless `path` already exists.
///
/// Returns false, leaving `path` untouched, if another writer got there
/// first. The temporary file is removed either way.
pub(crate) async fn persist_new(temp: &Path, path: &Path) -> Result<bool> {
    let linked = fs::hard_link(temp, path).await;
    let _ = fs::remove_file(temp).await;
    match linked {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(Error::io_path(path, e)),
    }
    if let Some(dir) = path.parent() {
        sync_dir(dir).await?;
    }
    Ok(true)
}

/// Atomically replace `path` with `data`: the file is either absent or
/// complete, and durable once this returns.
pub(crate) async fn write_durable(path: &Path, data: &[u8]) -> Result<()> {
    let temp = write_temp(path, data).await?;
    persist(&temp, path).await
}

/// Flush a directory's entries to stable storage.
#[cfg(unix)]
pub(crate) async fn sync_dir(dir: &Path) -> Result<()> {
    let handle = fs::File::open(dir)
        .await
        .map_err(|e| Error::io_path(dir, e))?;
    handle.sync_all().await.map_err(|e| Error::io_path(dir, e))
}

#[cfg(not(unix))]
pub(crate) async fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Create `dir` if it does not already exist.
pub(crate) async fn ensure_dir_exists(dir: &Path) -> Result<()> {
    match fs::create_dir(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(Error::io_path(dir, e)),
    }
}

/// True if `path` exists; errors other than not-found are returned.
pub(crate) async fn exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io_path(path, e)),
    }
}
