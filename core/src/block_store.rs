//! Content-addressed storage of file data blocks.
//!
//! Blocks are identified by the hash of their uncompressed content and are
//! never rewritten once stored. Each block lives in its own file:
//!
//! ```text
//! d/
//! └── 1a2/
//!     └── 1a2b...   (64 hex chars)
//! ```
//!
//! A block file holds an 8-byte magic, the uncompressed length as a
//! little-endian u64, and the zlib-compressed content. The length header lets
//! a redundant `put` check for a mismatch without decompressing.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::io::{TMP_PREFIX, ensure_dir_exists, exists, persist_new, write_temp};
use crate::stats::ValidateStats;
use crate::{BLOCK_HASH_LEN, BlockHash, Error, Result};

/// Name of the block directory inside the archive.
pub const BLOCK_DIR: &str = "d";

/// Take this many characters from the block hash to form the subdirectory name.
const SUBDIR_NAME_CHARS: usize = 3;

const BLOCK_MAGIC: &[u8; 8] = b"CNSBLK01";

const BLOCK_HEADER_LEN: usize = BLOCK_MAGIC.len() + 8;

/// Blocks checked concurrently by [`BlockStore::validate`].
const VALIDATE_CONCURRENCY: usize = 8;

/// What `put` did with a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The block was new and has been durably stored.
    Written { compressed_len: u64 },
    /// A block with this hash and length was already stored.
    AlreadyPresent,
}

/// A directory of content-addressed blocks, shared by every band in an
/// archive.
///
/// Cloning is cheap: the store holds only its path, so clones can be moved
/// into worker tasks.
#[derive(Debug, Clone)]
pub struct BlockStore {
    path: PathBuf,
}

impl BlockStore {
    /// Access an existing block directory at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Create an empty block directory.
    pub async fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        fs::create_dir(path)
            .await
            .map_err(|e| Error::io_path(path, e))?;
        Ok(Self::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn subdir_for(&self, hash: &BlockHash) -> PathBuf {
        let hex = hash.to_hex();
        self.path.join(&hex[..SUBDIR_NAME_CHARS])
    }

    /// Full path of the file holding `hash`.
    pub fn path_for(&self, hash: &BlockHash) -> PathBuf {
        self.subdir_for(hash).join(hash.to_hex())
    }

    /// True if a block is stored under `hash`.
    pub async fn has(&self, hash: &BlockHash) -> Result<bool> {
        exists(&self.path_for(hash)).await
    }

    /// Store `data` under `hash` unless it is already present.
    ///
    /// Returns only once the block is durable. An existing block with a
    /// different length is reported as corruption and left untouched.
    pub async fn put(&self, hash: &BlockHash, data: &[u8]) -> Result<PutOutcome> {
        debug_assert_eq!(*hash, BlockHash::of(data), "put with wrong hash");
        let path = self.path_for(hash);
        if exists(&path).await? {
            self.check_stored_len(hash, data.len() as u64).await?;
            debug!(block = %hash.short_string(), "Block already present");
            return Ok(PutOutcome::AlreadyPresent);
        }

        let encoded = encode_block(data)?;
        ensure_dir_exists(&self.subdir_for(hash)).await?;
        let temp = write_temp(&path, &encoded).await?;
        if !persist_new(&temp, &path).await? {
            // Another task or process stored it while we were writing.
            warn!(block = %hash.short_string(), "Late detection of existing block");
            self.check_stored_len(hash, data.len() as u64).await?;
            return Ok(PutOutcome::AlreadyPresent);
        }
        debug!(
            block = %hash.short_string(),
            len = data.len(),
            compressed_len = encoded.len(),
            "Stored block"
        );
        Ok(PutOutcome::Written {
            compressed_len: encoded.len() as u64,
        })
    }

    /// Read back and verify the uncompressed content of a block.
    pub async fn get(&self, hash: &BlockHash) -> Result<Bytes> {
        let path = self.path_for(hash);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::BlockNotFound { hash: *hash });
            }
            Err(e) => return Err(Error::io_path(&path, e)),
        };
        decode_block(hash, &raw).map(Bytes::from)
    }

    /// Uncompressed length recorded in a stored block's header.
    pub async fn stored_len(&self, hash: &BlockHash) -> Result<u64> {
        let path = self.path_for(hash);
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::BlockNotFound { hash: *hash });
            }
            Err(e) => return Err(Error::io_path(&path, e)),
        };
        let mut header = [0u8; BLOCK_HEADER_LEN];
        match file.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(integrity(hash, "block file is shorter than its header"));
            }
            Err(e) => return Err(Error::io_path(&path, e)),
        }
        parse_header(hash, &header)
    }

    async fn check_stored_len(&self, hash: &BlockHash, expected: u64) -> Result<()> {
        let stored = self.stored_len(hash).await?;
        if stored != expected {
            return Err(integrity(
                hash,
                format!("stored length {} differs from new content length {}", stored, expected),
            ));
        }
        Ok(())
    }

    /// Return the sorted names of all blocks in the store.
    ///
    /// Temporary files and anything that does not look like a block are
    /// skipped.
    pub async fn block_names(&self) -> Result<Vec<BlockHash>> {
        let mut names = Vec::new();
        let mut subdirs = fs::read_dir(&self.path)
            .await
            .map_err(|e| Error::io_path(&self.path, e))?;
        while let Some(subdir) = subdirs.next_entry().await? {
            let subdir_name = subdir.file_name();
            let Some(subdir_name) = subdir_name.to_str() else {
                warn!(path = %subdir.path().display(), "Unexpected entry in block directory");
                continue;
            };
            if subdir_name.len() != SUBDIR_NAME_CHARS || !subdir.file_type().await?.is_dir() {
                warn!(name = subdir_name, "Unexpected entry in block directory");
                continue;
            }
            let mut files = fs::read_dir(subdir.path()).await?;
            while let Some(entry) = files.next_entry().await? {
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else {
                    continue;
                };
                if name.starts_with(TMP_PREFIX) || name.len() != BLOCK_HASH_LEN * 2 {
                    continue;
                }
                match name.parse::<BlockHash>() {
                    Ok(hash) if name.starts_with(subdir_name) => names.push(hash),
                    _ => warn!(name, "Unexpected file in block directory"),
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Re-read every block and check its content against its name.
    pub async fn validate(&self) -> Result<ValidateStats> {
        let names = self.block_names().await?;
        let mut stats = ValidateStats::default();
        let mut results = stream::iter(names)
            .map(|hash| async move { (hash, self.get(&hash).await) })
            .buffer_unordered(VALIDATE_CONCURRENCY);
        while let Some((hash, result)) = results.next().await {
            stats.blocks += 1;
            match result {
                Ok(content) => stats.block_bytes += content.len() as u64,
                Err(e @ Error::Integrity { .. }) => {
                    warn!(block = %hash, error = %e, "Corrupt block");
                    stats.corrupt_blocks += 1;
                }
                Err(e) => {
                    warn!(block = %hash, error = %e, "Unreadable block");
                    stats.unreadable_blocks += 1;
                }
            }
        }
        Ok(stats)
    }
}

fn integrity(hash: &BlockHash, reason: impl Into<String>) -> Error {
    Error::Integrity {
        hash: *hash,
        reason: reason.into(),
    }
}

fn encode_block(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(BLOCK_HEADER_LEN + data.len() / 2);
    out.extend_from_slice(BLOCK_MAGIC);
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    let mut encoder = flate2::write::ZlibEncoder::new(out, flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn parse_header(hash: &BlockHash, header: &[u8]) -> Result<u64> {
    if header.len() < BLOCK_HEADER_LEN || &header[..BLOCK_MAGIC.len()] != BLOCK_MAGIC {
        return Err(integrity(hash, "bad block header"));
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&header[BLOCK_MAGIC.len()..BLOCK_HEADER_LEN]);
    Ok(u64::from_le_bytes(len))
}

/// Decompress a block file and check it against its hash.
pub(crate) fn decode_block(hash: &BlockHash, raw: &[u8]) -> Result<Vec<u8>> {
    let expected_len = parse_header(hash, raw)?;
    let mut decoder = flate2::read::ZlibDecoder::new(&raw[BLOCK_HEADER_LEN..]);
    let mut content = Vec::with_capacity(expected_len.min(1 << 24) as usize);
    decoder
        .read_to_end(&mut content)
        .map_err(|e| integrity(hash, format!("decompression failed: {}", e)))?;
    if content.len() as u64 != expected_len {
        return Err(integrity(
            hash,
            format!("header length {} but content is {} bytes", expected_len, content.len()),
        ));
    }
    let actual = BlockHash::of(&content);
    if actual != *hash {
        return Err(integrity(hash, format!("content hashes to {}", actual)));
    }
    Ok(content)
}

/// Uncompressed length from a raw block file, for inspection.
pub(crate) fn block_header_len(raw: &[u8]) -> Option<u64> {
    if raw.len() < BLOCK_HEADER_LEN || &raw[..BLOCK_MAGIC.len()] != BLOCK_MAGIC {
        return None;
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&raw[BLOCK_MAGIC.len()..BLOCK_HEADER_LEN]);
    Some(u64::from_le_bytes(len))
}
