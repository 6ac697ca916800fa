use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Length in bytes of a [`BlockHash`].
pub const BLOCK_HASH_LEN: usize = 32;

/// The content hash identifying a stored block.
///
/// Hashes are BLAKE3 digests of the uncompressed block content. They are
/// rendered as lowercase hex in file names and JSON, and as 32 raw bytes in
/// binary records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHash(blake3::Hash);

impl BlockHash {
    pub fn new(hash: blake3::Hash) -> Self {
        Self(hash)
    }

    /// Hash a block of content.
    pub fn of(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_HASH_LEN] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }
}

impl PartialOrd for BlockHash {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BlockHash {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl From<blake3::Hash> for BlockHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(hash)
    }
}

impl FromStr for BlockHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != BLOCK_HASH_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut array = [0u8; BLOCK_HASH_LEN];
        array.copy_from_slice(&bytes);
        Ok(Self(blake3::Hash::from(array)))
    }
}

impl Serialize for BlockHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.as_bytes().serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            BlockHash::from_str(&s).map_err(serde::de::Error::custom)
        } else {
            let bytes = <[u8; BLOCK_HASH_LEN]>::deserialize(deserializer)?;
            Ok(Self(blake3::Hash::from(bytes)))
        }
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hash a block of content. Changing the algorithm is a format change.
pub fn hash_bytes(data: &[u8]) -> BlockHash {
    BlockHash::of(data)
}

/// Sequence number of a band within an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BandId(u32);

impl BandId {
    pub const ZERO: BandId = BandId(0);

    pub fn new(n: u32) -> Self {
        Self(n)
    }

    pub fn number(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> BandId {
        BandId(self.0 + 1)
    }

    /// Name of the band's directory inside the archive.
    pub fn dir_name(&self) -> String {
        format!("b{}", self)
    }

    /// Parse a band directory name such as `b0003`.
    pub fn from_dir_name(name: &str) -> Option<BandId> {
        let digits = name.strip_prefix('b')?;
        if digits.len() < 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(BandId)
    }
}

impl fmt::Display for BandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

impl FromStr for BandId {
    type Err = std::num::ParseIntError;

    /// Accepts `3`, `0003` or `b0003`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('b').unwrap_or(s).parse().map(BandId)
    }
}

/// Kind of a file-tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    File,
    Dir,
    Symlink,
    /// Fifos, sockets and devices: recorded with metadata but no content.
    Special,
}

impl Kind {
    pub fn is_file(&self) -> bool {
        matches!(self, Kind::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Kind::Dir)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, Kind::Symlink)
    }
}

impl From<std::fs::FileType> for Kind {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_file() {
            Kind::File
        } else if ft.is_dir() {
            Kind::Dir
        } else if ft.is_symlink() {
            Kind::Symlink
        } else {
            Kind::Special
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::File => "file",
            Kind::Dir => "dir",
            Kind::Symlink => "symlink",
            Kind::Special => "special",
        };
        f.pad(s)
    }
}
