//! Read-only decoding of any persisted archive file, for diagnostics.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;

use crate::archive::{ARCHIVE_MARKER_FILENAME, ArchiveConfig};
use crate::band::{BAND_HEAD_FILENAME, BAND_TAIL_FILENAME, BandHead, BandTail, read_json};
use crate::block_store::{block_header_len, decode_block};
use crate::index::{INDEX_FILENAME, IndexEntry, IndexHeader, IndexReader};
use crate::{BLOCK_HASH_LEN, BlockHash, Error, Result};

/// A decoded archive file.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    ArchiveMarker(ArchiveConfig),
    BandHead(BandHead),
    BandTail(BandTail),
    Index {
        header: IndexHeader,
        entries: Vec<IndexEntry>,
        /// True if the trailer was found.
        complete: bool,
        /// Why reading stopped early, if it did.
        problem: Option<String>,
    },
    Block {
        hash: Option<BlockHash>,
        uncompressed_len: u64,
        stored_len: u64,
        /// Whether the content matched the hash in the file name.
        verified: Option<bool>,
        problem: Option<String>,
    },
}

/// Decode the file at `path`, choosing the format from its name.
///
/// Nothing is ever written. Truncated indexes are returned up to the
/// damage with `complete: false`.
pub async fn inspect<P: AsRef<Path>>(path: P) -> Result<Record> {
    let path = path.as_ref();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    match name {
        ARCHIVE_MARKER_FILENAME => Ok(Record::ArchiveMarker(read_json(path).await?)),
        BAND_HEAD_FILENAME => Ok(Record::BandHead(read_json(path).await?)),
        BAND_TAIL_FILENAME => Ok(Record::BandTail(read_json(path).await?)),
        INDEX_FILENAME => inspect_index(path).await,
        _ if name.len() == BLOCK_HASH_LEN * 2 => inspect_block(path, name.parse().ok()).await,
        _ => sniff(path).await,
    }
}

async fn inspect_index(path: &Path) -> Result<Record> {
    let mut reader = IndexReader::open(path).await?;
    let header = reader.header().clone();
    let mut entries = Vec::new();
    let mut problem = None;
    let mut complete = false;
    loop {
        match reader.next_entry().await {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {
                complete = true;
                break;
            }
            Err(e @ (Error::TruncatedIndex { .. } | Error::InvalidFormat { .. })) => {
                problem = Some(e.to_string());
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Record::Index {
        header,
        entries,
        complete,
        problem,
    })
}

async fn inspect_block(path: &Path, hash: Option<BlockHash>) -> Result<Record> {
    let raw = fs::read(path).await.map_err(|e| Error::io_path(path, e))?;
    let uncompressed_len = block_header_len(&raw)
        .ok_or_else(|| Error::invalid_format(path, "not a block file"))?;
    let (verified, problem) = match hash {
        Some(hash) => match decode_block(&hash, &raw) {
            Ok(_) => (Some(true), None),
            Err(e) => (Some(false), Some(e.to_string())),
        },
        None => (None, None),
    };
    Ok(Record::Block {
        hash,
        uncompressed_len,
        stored_len: raw.len() as u64,
        verified,
        problem,
    })
}

/// Try each format in turn for a file with an unfamiliar name.
async fn sniff(path: &Path) -> Result<Record> {
    let raw = fs::read(path).await.map_err(|e| Error::io_path(path, e))?;
    if block_header_len(&raw).is_some() {
        return inspect_block(path, None).await;
    }
    if let Ok(config) = serde_json::from_slice::<ArchiveConfig>(&raw) {
        return Ok(Record::ArchiveMarker(config));
    }
    if let Ok(head) = serde_json::from_slice::<BandHead>(&raw) {
        return Ok(Record::BandHead(head));
    }
    if let Ok(tail) = serde_json::from_slice::<BandTail>(&raw) {
        return Ok(Record::BandTail(tail));
    }
    match inspect_index(path).await {
        Ok(record) => Ok(record),
        Err(_) => Err(Error::invalid_format(
            PathBuf::from(path),
            "not a recognized archive record",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupOptions, NullMonitor, backup};
    use crate::{Archive, Kind};
    use tempfile::TempDir;

    async fn backed_up_archive() -> (TempDir, Archive) {
        let dir = TempDir::new().unwrap();
        let archive = Archive::create(dir.path().join("archive")).await.unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("f"), b"some content").unwrap();
        backup(&archive, &source, &BackupOptions::default(), &NullMonitor)
            .await
            .unwrap();
        (dir, archive)
    }

    #[tokio::test]
    async fn test_inspect_each_record_kind() {
        let (_dir, archive) = backed_up_archive().await;
        let band_dir = archive.path().join("b0000");

        assert!(matches!(
            inspect(archive.path().join(ARCHIVE_MARKER_FILENAME)).await.unwrap(),
            Record::ArchiveMarker(_)
        ));
        assert!(matches!(
            inspect(band_dir.join(BAND_HEAD_FILENAME)).await.unwrap(),
            Record::BandHead(_)
        ));
        assert!(matches!(
            inspect(band_dir.join(BAND_TAIL_FILENAME)).await.unwrap(),
            Record::BandTail(_)
        ));
        match inspect(band_dir.join(INDEX_FILENAME)).await.unwrap() {
            Record::Index {
                entries, complete, ..
            } => {
                assert!(complete);
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[1].kind, Kind::File);
            }
            other => panic!("unexpected record {:?}", other),
        }

        let hash = BlockHash::of(b"some content");
        match inspect(archive.block_store().path_for(&hash)).await.unwrap() {
            Record::Block {
                hash: Some(h),
                uncompressed_len,
                verified,
                ..
            } => {
                assert_eq!(h, hash);
                assert_eq!(uncompressed_len, 12);
                assert_eq!(verified, Some(true));
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inspect_does_not_modify() {
        let (_dir, archive) = backed_up_archive().await;
        let index = archive.path().join("b0000").join(INDEX_FILENAME);
        let before = std::fs::read(&index).unwrap();
        inspect(&index).await.unwrap();
        assert_eq!(std::fs::read(&index).unwrap(), before);
    }

    #[tokio::test]
    async fn test_inspect_truncated_index() {
        let (_dir, archive) = backed_up_archive().await;
        let index = archive.path().join("b0000").join(INDEX_FILENAME);
        let copy = archive.path().join("copied-index");
        let data = std::fs::read(&index).unwrap();
        std::fs::write(&copy, &data[..data.len() - 3]).unwrap();

        match inspect(&copy).await.unwrap() {
            Record::Index {
                complete, problem, ..
            } => {
                assert!(!complete);
                assert!(problem.is_some());
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inspect_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, b"\x01\x00\x00\x00z").unwrap();
        let err = inspect(&path).await.unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }
}
