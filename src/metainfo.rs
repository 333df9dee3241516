//! Parsing of the bencoded torrent metainfo file.
//!
//! The bencode encoding/decoding itself is treated as a black box and is
//! delegated entirely to `serde_bencode`; this module only concerns itself
//! with the shape of the `info` dictionary and the derived quantities
//! (`info_hash`, piece count, piece lengths) the rest of the engine needs.

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{error::Error, PieceIndex, Sha1Hash};

/// A parsed torrent metainfo file.
#[derive(Debug, Clone, Deserialize)]
pub struct Metainfo {
    pub info: Info,
}

impl Metainfo {
    /// Parses a metainfo file from its raw bencoded bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        Ok(serde_bencode::from_bytes(buf)?)
    }

    /// Computes the SHA-1 info hash, which is the hash of the bencoded `info`
    /// dictionary exactly as deserialized.
    ///
    /// `serde_bencode::to_bytes` re-encodes the `Info` struct's fields in
    /// their declared order, which matches the canonical key ordering
    /// bencode requires (keys sorted as raw byte strings); since this
    /// struct's field names already sort that way, re-encoding reproduces
    /// the original bytes.
    pub fn info_hash(&self) -> Result<Sha1Hash, Error> {
        let bytes = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&bytes);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Returns the number of 20-byte SHA-1 hashes in the `pieces` field.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Returns the total length of the download, in bytes: the single
    /// file's length, or the sum of all files' lengths for a multi-file
    /// torrent.
    pub fn total_length(&self) -> Result<u64, Error> {
        match (&self.info.length, &self.info.files) {
            (Some(len), _) => Ok(*len),
            (None, Some(files)) => Ok(files.iter().map(|f| f.length).sum()),
            (None, None) => Err(Error::InvalidMetainfo(
                "info dictionary has neither `length` nor `files`".into(),
            )),
        }
    }

    /// Returns the length of the piece at `index`, accounting for the final,
    /// possibly shorter, piece.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32, Error> {
        let piece_count = self.piece_count();
        if piece_count == 0 || index >= piece_count {
            return Err(Error::InvalidPieceIndex(index));
        }
        if index < piece_count - 1 {
            return Ok(self.info.piece_length as u32);
        }
        let total_length = self.total_length()?;
        let last_len =
            total_length - self.info.piece_length * (piece_count - 1) as u64;
        Ok(last_len as u32)
    }

    /// Returns the expected SHA-1 digest of the piece at `index`.
    pub fn piece_hash(&self, index: PieceIndex) -> Result<Sha1Hash, Error> {
        let start = index * 20;
        let end = start + 20;
        let slice = self
            .info
            .pieces
            .get(start..end)
            .ok_or(Error::InvalidPieceIndex(index))?;
        let mut hash = [0; 20];
        hash.copy_from_slice(slice);
        Ok(hash)
    }
}

/// The `info` dictionary of a torrent metainfo file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    pub name: String,

    #[serde(rename = "piece length")]
    pub piece_length: u64,

    #[serde(with = "serde_bytes")]
    pub pieces: ByteBuf,

    /// Present for single-file torrents.
    pub length: Option<u64>,

    /// Present for multi-file torrents.
    pub files: Option<Vec<File>>,

    pub private: Option<u8>,
}

/// A single file entry in a multi-file torrent's `files` list.
///
/// `path` is kept only to make the metainfo representation complete; the
/// engine does not reconstruct a multi-file directory tree on disk (see
/// Non-goals) and only uses `length` when summing the total download size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: u64,
}
