//! Band index: the list of entries in a backup, with the blocks holding each
//! file's content.
//!
//! The index is one file of length-prefixed frames. Each frame is a u32
//! little-endian payload length followed by a bincode payload. The first
//! frame is an [`IndexHeader`]; every later frame is an [`IndexRecord`], with
//! a `Trailer` as the last one. An index without its trailer was not
//! finished and is never read as complete.
//!
//! A file with more block hashes than fit in one frame is written as
//! `Blocks` frames holding the leading hashes, followed by its `Entry`
//! frame with the rest.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

use crate::{Apath, BlockHash, Error, Kind, Result};

/// Name of the index file inside a band directory.
pub const INDEX_FILENAME: &str = "index";

pub const INDEX_MAGIC: &str = "conserve-index";

pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Frames larger than this are treated as corruption rather than allocated.
const MAX_FRAME_LEN: u32 = 64 << 20;

/// Block hashes carried by one frame; 32 MiB of hashes.
const BLOCKS_PER_FRAME: usize = 1 << 20;

/// One file, directory, symlink or special file in a band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub apath: Apath,
    pub kind: Kind,
    /// Content length for files; zero for everything else.
    pub size: u64,
    /// Modification time in seconds since the Unix epoch.
    pub mtime: i64,
    pub unix_mode: Option<u32>,
    /// Target of a symlink.
    pub target: Option<String>,
    /// Hashes of the blocks that make up a file's content, in order.
    pub blocks: Vec<BlockHash>,
}

impl IndexEntry {
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHeader {
    pub magic: String,
    pub format_version: u32,
}

impl Default for IndexHeader {
    fn default() -> Self {
        Self {
            magic: INDEX_MAGIC.to_string(),
            format_version: INDEX_FORMAT_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexRecord {
    Entry(IndexEntry),
    /// Leading block hashes of the next entry.
    Blocks(Vec<BlockHash>),
    Trailer { entry_count: u64 },
}

/// Streams entries into a new index file.
///
/// Entries must arrive in strictly increasing apath order. Nothing is
/// buffered beyond the file writer, so trees of any size can be written.
/// Dropping the writer without calling [`IndexWriter::finish`] leaves an
/// index without a trailer.
pub struct IndexWriter {
    path: PathBuf,
    file: BufWriter<fs::File>,
    last_apath: Option<Apath>,
    entry_count: u64,
    blocks_per_frame: usize,
}

impl IndexWriter {
    /// Create the index file at `path`, which must not already exist.
    pub async fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| Error::io_path(&path, e))?;
        let mut writer = Self {
            path,
            file: BufWriter::new(file),
            last_apath: None,
            entry_count: 0,
            blocks_per_frame: BLOCKS_PER_FRAME,
        };
        let header = bincode::serialize(&IndexHeader::default())?;
        writer.write_frame(&header).await?;
        Ok(writer)
    }

    async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let len = match u32::try_from(payload.len()) {
            Ok(len) if len <= MAX_FRAME_LEN => len,
            _ => {
                return Err(Error::IndexRecordTooLarge {
                    path: self.path.clone(),
                    len: payload.len(),
                });
            }
        };
        let written = async {
            self.file.write_u32_le(len).await?;
            self.file.write_all(payload).await
        }
        .await;
        written.map_err(|e| Error::io_path(&self.path, e))
    }

    /// Append one entry.
    pub async fn push(&mut self, entry: &IndexEntry) -> Result<()> {
        if let Some(previous) = &self.last_apath {
            if entry.apath <= *previous {
                return Err(Error::UnorderedIndex {
                    previous: previous.clone(),
                    apath: entry.apath.clone(),
                });
            }
        }
        let mut blocks = entry.blocks.as_slice();
        while blocks.len() > self.blocks_per_frame {
            let (leading, rest) = blocks.split_at(self.blocks_per_frame);
            let payload = bincode::serialize(&IndexRecord::Blocks(leading.to_vec()))?;
            self.write_frame(&payload).await?;
            blocks = rest;
        }
        let last = IndexEntry {
            blocks: blocks.to_vec(),
            ..entry.clone()
        };
        let payload = bincode::serialize(&IndexRecord::Entry(last))?;
        self.write_frame(&payload).await?;
        self.last_apath = Some(entry.apath.clone());
        self.entry_count += 1;
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Write the trailer and make the index durable.
    ///
    /// Returns the number of entries written.
    pub async fn finish(mut self) -> Result<u64> {
        let trailer = bincode::serialize(&IndexRecord::Trailer {
            entry_count: self.entry_count,
        })?;
        self.write_frame(&trailer).await?;
        self.file
            .flush()
            .await
            .map_err(|e| Error::io_path(&self.path, e))?;
        self.file
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| Error::io_path(&self.path, e))?;
        debug!(path = %self.path.display(), entries = self.entry_count, "Finished index");
        Ok(self.entry_count)
    }
}

/// Reads entries lazily from an index file, in stored order.
///
/// Open it again to start over from the beginning.
pub struct IndexReader {
    path: PathBuf,
    file: BufReader<fs::File>,
    header: IndexHeader,
    entries_read: u64,
    finished: bool,
}

impl IndexReader {
    /// Open an index file and check its header.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::File::open(&path)
            .await
            .map_err(|e| Error::io_path(&path, e))?;
        let mut file = BufReader::new(file);
        let header_frame = match read_frame(&path, &mut file).await? {
            Some(frame) => frame,
            None => return Err(Error::invalid_format(&path, "empty index file")),
        };
        let header: IndexHeader = bincode::deserialize(&header_frame)
            .map_err(|e| Error::invalid_format(&path, format!("bad index header: {}", e)))?;
        if header.magic != INDEX_MAGIC {
            return Err(Error::invalid_format(&path, "not an index file"));
        }
        if header.format_version != INDEX_FORMAT_VERSION {
            return Err(Error::invalid_format(
                &path,
                format!("unsupported index format version {}", header.format_version),
            ));
        }
        Ok(Self {
            path,
            file,
            header,
            entries_read: 0,
            finished: false,
        })
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries_read(&self) -> u64 {
        self.entries_read
    }

    /// Read the next entry, or `None` after the trailer.
    ///
    /// Fails with [`Error::TruncatedIndex`] if the file ends before the
    /// trailer.
    pub async fn next_entry(&mut self) -> Result<Option<IndexEntry>> {
        if self.finished {
            return Ok(None);
        }
        let mut leading_blocks = Vec::new();
        loop {
            let frame = match read_frame(&self.path, &mut self.file).await? {
                Some(frame) => frame,
                None => {
                    return Err(Error::TruncatedIndex {
                        path: self.path.clone(),
                        entries_read: self.entries_read,
                    });
                }
            };
            let record: IndexRecord = bincode::deserialize(&frame).map_err(|e| {
                Error::invalid_format(&self.path, format!("bad index record: {}", e))
            })?;
            match record {
                IndexRecord::Blocks(blocks) => leading_blocks.extend(blocks),
                IndexRecord::Entry(mut entry) => {
                    if !Apath::is_valid(entry.apath.as_str()) {
                        return Err(Error::invalid_format(
                            &self.path,
                            format!("invalid apath {:?}", entry.apath.as_str()),
                        ));
                    }
                    if !leading_blocks.is_empty() {
                        leading_blocks.append(&mut entry.blocks);
                        entry.blocks = leading_blocks;
                    }
                    self.entries_read += 1;
                    return Ok(Some(entry));
                }
                IndexRecord::Trailer { entry_count } => {
                    if !leading_blocks.is_empty() {
                        return Err(Error::invalid_format(
                            &self.path,
                            "block list without an entry before the trailer",
                        ));
                    }
                    if entry_count != self.entries_read {
                        return Err(Error::invalid_format(
                            &self.path,
                            format!(
                                "trailer counts {} entries but {} were read",
                                entry_count, self.entries_read
                            ),
                        ));
                    }
                    self.finished = true;
                    return Ok(None);
                }
            }
        }
    }

    /// Read all remaining entries into memory.
    pub async fn read_all(mut self) -> Result<Vec<IndexEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry().await? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Read one frame; `None` at a clean end of file.
async fn read_frame(path: &Path, file: &mut BufReader<fs::File>) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        let n = file
            .read(&mut len_bytes[filled..])
            .await
            .map_err(|e| Error::io_path(path, e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    if filled < len_bytes.len() {
        return Err(Error::invalid_format(path, "truncated frame length"));
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(Error::invalid_format(path, format!("frame of {} bytes is too large", len)));
    }
    let mut payload = vec![0u8; len as usize];
    match file.read_exact(&mut payload).await {
        Ok(_) => Ok(Some(payload)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(Error::invalid_format(path, "truncated frame"))
        }
        Err(e) => Err(Error::io_path(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_entry(apath: &str, content: &[&[u8]]) -> IndexEntry {
        IndexEntry {
            apath: Apath::try_from(apath).unwrap(),
            kind: Kind::File,
            size: content.iter().map(|c| c.len() as u64).sum(),
            mtime: 1_600_000_000,
            unix_mode: Some(0o644),
            target: None,
            blocks: content.iter().map(|c| BlockHash::of(c)).collect(),
        }
    }

    fn dir_entry(apath: &str) -> IndexEntry {
        IndexEntry {
            apath: Apath::try_from(apath).unwrap(),
            kind: Kind::Dir,
            size: 0,
            mtime: 1_600_000_000,
            unix_mode: Some(0o755),
            target: None,
            blocks: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_write_and_read_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INDEX_FILENAME);
        let entries = vec![
            dir_entry("/"),
            file_entry("/a", &[b"one", b"two"]),
            dir_entry("/sub"),
            file_entry("/sub/b", &[]),
        ];
        let mut writer = IndexWriter::create(&path).await.unwrap();
        for entry in &entries {
            writer.push(entry).await.unwrap();
        }
        assert_eq!(writer.finish().await.unwrap(), 4);

        let reader = IndexReader::open(&path).await.unwrap();
        assert_eq!(reader.header(), &IndexHeader::default());
        assert_eq!(reader.read_all().await.unwrap(), entries);

        // Can be read again from the start.
        let mut reader = IndexReader::open(&path).await.unwrap();
        assert_eq!(reader.next_entry().await.unwrap(), Some(entries[0].clone()));
        assert_eq!(reader.entries_read(), 1);
    }

    #[tokio::test]
    async fn test_rejects_unordered_entries() {
        let dir = TempDir::new().unwrap();
        let mut writer = IndexWriter::create(dir.path().join(INDEX_FILENAME)).await.unwrap();
        writer.push(&dir_entry("/")).await.unwrap();
        writer.push(&file_entry("/b", &[])).await.unwrap();
        let err = writer.push(&file_entry("/a", &[])).await.unwrap_err();
        assert!(matches!(err, Error::UnorderedIndex { .. }));
        let err = writer.push(&file_entry("/b", &[])).await.unwrap_err();
        assert!(matches!(err, Error::UnorderedIndex { .. }));
    }

    #[tokio::test]
    async fn test_unfinished_index_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INDEX_FILENAME);
        {
            let mut writer = IndexWriter::create(&path).await.unwrap();
            writer.push(&dir_entry("/")).await.unwrap();
            writer.file.flush().await.unwrap();
        }
        let mut reader = IndexReader::open(&path).await.unwrap();
        assert!(reader.next_entry().await.unwrap().is_some());
        let err = reader.next_entry().await.unwrap_err();
        assert!(matches!(err, Error::TruncatedIndex { entries_read: 1, .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_bad_header_is_invalid_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INDEX_FILENAME);
        let payload = bincode::serialize(&IndexHeader {
            magic: INDEX_MAGIC.to_string(),
            format_version: 99,
        })
        .unwrap();
        let mut data = (payload.len() as u32).to_le_bytes().to_vec();
        data.extend_from_slice(&payload);
        std::fs::write(&path, data).unwrap();
        let err = IndexReader::open(&path).await.err().unwrap();
        assert!(matches!(err, Error::InvalidFormat { .. }));

        std::fs::write(&path, b"garbage that is not an index").unwrap();
        assert!(matches!(
            IndexReader::open(&path).await.err().unwrap(),
            Error::InvalidFormat { .. }
        ));
    }

    fn numbered_hashes(count: u32) -> Vec<BlockHash> {
        (0..count)
            .map(|i| {
                let mut bytes = [0u8; 32];
                bytes[..4].copy_from_slice(&i.to_le_bytes());
                BlockHash::new(blake3::Hash::from(bytes))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_long_block_list_is_split_across_frames() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INDEX_FILENAME);
        let mut big = file_entry("/big", &[]);
        big.blocks = numbered_hashes(10);
        let entries = vec![dir_entry("/"), big, file_entry("/small", &[b"x"])];

        let mut writer = IndexWriter::create(&path).await.unwrap();
        writer.blocks_per_frame = 3;
        for entry in &entries {
            writer.push(entry).await.unwrap();
        }
        assert_eq!(writer.finish().await.unwrap(), 3);

        let reader = IndexReader::open(&path).await.unwrap();
        assert_eq!(reader.read_all().await.unwrap(), entries);
    }

    #[tokio::test]
    async fn test_file_with_a_million_blocks_reads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INDEX_FILENAME);
        let mut big = file_entry("/big", &[]);
        big.blocks = numbered_hashes(1_000_000);
        big.size = 4096 * 1_000_000;

        let mut writer = IndexWriter::create(&path).await.unwrap();
        writer.push(&dir_entry("/")).await.unwrap();
        writer.push(&big).await.unwrap();
        writer.finish().await.unwrap();

        let entries = IndexReader::open(&path).await.unwrap().read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], big);
    }

    #[tokio::test]
    async fn test_oversized_record_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INDEX_FILENAME);
        let mut writer = IndexWriter::create(&path).await.unwrap();
        writer.push(&dir_entry("/")).await.unwrap();
        let mut link = dir_entry("/link");
        link.kind = Kind::Symlink;
        link.target = Some("x".repeat(MAX_FRAME_LEN as usize + 1));
        let err = writer.push(&link).await.unwrap_err();
        assert!(matches!(err, Error::IndexRecordTooLarge { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_create_refuses_existing_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INDEX_FILENAME);
        IndexWriter::create(&path).await.unwrap().finish().await.unwrap();
        assert!(IndexWriter::create(&path).await.is_err());
    }
}
