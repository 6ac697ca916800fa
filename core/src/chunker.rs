use tokio::io::{AsyncRead, AsyncReadExt};

/// Break files into blocks of this many bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 20;

/// Splits content into fixed-size chunks.
///
/// Chunk boundaries depend only on the offset in the content, so identical
/// content always yields identical chunks regardless of how reads are
/// split.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    block_size: usize,
}

impl Chunker {
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be positive");
        Self { block_size }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Split in-memory data. Empty data yields no chunks.
    pub fn chunk_data<'a>(&self, data: &'a [u8]) -> Vec<&'a [u8]> {
        data.chunks(self.block_size).collect()
    }

    pub fn reader<R: AsyncRead + Unpin>(&self, reader: R) -> ChunkReader<R> {
        ChunkReader {
            reader,
            buf: vec![0; self.block_size],
        }
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

/// Reads successive chunks from a stream, reusing one buffer.
pub struct ChunkReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    /// Read the next chunk: full-sized unless it is the last one. Returns
    /// `None` at end of input.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<&[u8]>> {
        let mut filled = 0;
        while filled < self.buf.len() {
            let n = self.reader.read(&mut self.buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            Ok(None)
        } else {
            Ok(Some(&self.buf[..filled]))
        }
    }
}
