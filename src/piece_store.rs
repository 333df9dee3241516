//! Persists verified piece data to a resumable on-disk journal, and
//! assembles the final output file once every piece has been verified.
//!
//! The journal format is a flat sequence of `(index: u32 BE, length: u32 BE,
//! payload: length bytes)` records, written one append syscall at a time, no
//! trailing checksum. A corrupt or partial trailing record (the tell-tale
//! sign of a crash mid-write) is silently discarded rather than treated as a
//! fatal error, so the journal heals itself across restarts. This mirrors
//! the much richer multi-file disk actor in `disk/io.rs`, simplified down to
//! the single-file, single-writer-at-a-time model the engine here uses:
//! there is no in-progress block write buffer, since `save` is only ever
//! called with an already-assembled, already-hash-verified piece.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::{error::Error, PieceIndex, Sha1Hash};

/// Loads, appends to, and finalizes the resume journal for one torrent.
pub(crate) struct PieceStore {
    journal_path: PathBuf,
    output_path: PathBuf,
    piece_hashes: Vec<u8>,
    total_length: u64,
    /// Verified pieces kept in memory, keyed by index, so `finalize` doesn't
    /// need to re-read the journal.
    verified: HashMap<PieceIndex, Vec<u8>>,
}

impl PieceStore {
    /// Opens (or creates) the journal next to `metainfo_path`, replaying any
    /// existing records to recover verified pieces from a previous run.
    pub async fn open(
        metainfo_path: &Path,
        output_path: PathBuf,
        piece_hashes: Vec<u8>,
        total_length: u64,
    ) -> Result<Self, Error> {
        let mut journal_path = metainfo_path.as_os_str().to_owned();
        journal_path.push(".state");
        let journal_path = PathBuf::from(journal_path);

        let mut store = Self {
            journal_path,
            output_path,
            piece_hashes,
            total_length,
            verified: HashMap::new(),
        };
        store.load_journal().await?;
        Ok(store)
    }

    /// Replays the journal, verifying and retaining every valid record.
    /// Records that fail to parse or whose payload doesn't match the
    /// expected hash are logged and skipped; a partial trailing record (the
    /// file ends mid-record) ends replay without error.
    async fn load_journal(&mut self) -> Result<(), Error> {
        let bytes = match fs::read(&self.journal_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut cursor = &bytes[..];
        loop {
            match read_record(&mut cursor) {
                Some((index, payload)) => {
                    if self.verify(index, &payload) {
                        // last occurrence wins on load, per the journal's
                        // at-most-one-writer append semantics
                        self.verified.insert(index, payload);
                    } else {
                        log::warn!("journal record for piece {} failed verification", index);
                    }
                }
                None => break,
            }
        }

        log::info!(
            "resumed {} verified piece(s) from journal",
            self.verified.len()
        );
        Ok(())
    }

    fn verify(&self, index: PieceIndex, payload: &[u8]) -> bool {
        match self.piece_hash(index) {
            Some(expected) => Sha1::digest(payload).as_slice() == expected,
            None => false,
        }
    }

    fn piece_hash(&self, index: PieceIndex) -> Option<Sha1Hash> {
        let start = index * 20;
        let end = start + 20;
        let slice = self.piece_hashes.get(start..end)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(slice);
        Some(hash)
    }

    /// Returns the set of pieces already verified, for seeding the scheduler.
    pub fn verified_indices(&self) -> impl Iterator<Item = &PieceIndex> {
        self.verified.keys()
    }

    pub fn is_verified(&self, index: PieceIndex) -> bool {
        self.verified.contains_key(&index)
    }

    /// Hashes `bytes` against the expected digest for `index`. Callers must
    /// check this before calling `save`.
    pub fn matches_hash(&self, index: PieceIndex, bytes: &[u8]) -> bool {
        self.verify(index, bytes)
    }

    /// Appends one record to the journal and retains the piece in memory.
    /// Must only be called once `matches_hash` has confirmed the piece.
    pub async fn save(&mut self, index: PieceIndex, bytes: Vec<u8>) -> Result<(), Error> {
        debug_assert!(self.matches_hash(index, &bytes));

        let mut record = Vec::with_capacity(8 + bytes.len());
        record.extend_from_slice(&(index as u32).to_be_bytes());
        record.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        record.extend_from_slice(&bytes);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .await?;
        file.write_all(&record).await?;
        file.flush().await?;

        self.verified.insert(index, bytes);
        Ok(())
    }

    pub fn verified_count(&self) -> usize {
        self.verified.len()
    }

    /// Writes the output file by concatenating every verified piece in
    /// index order, then deletes the journal. Only valid to call once every
    /// piece index is verified. Writes to a temp file and renames it into
    /// place so the output never appears partially written.
    pub async fn finalize(&self, piece_count: usize) -> Result<(), Error> {
        debug_assert_eq!(self.verified.len(), piece_count);

        let mut tmp_path = self.output_path.clone().into_os_string();
        tmp_path.push(".part");
        let tmp_path = PathBuf::from(tmp_path);

        let mut tmp = File::create(&tmp_path).await?;
        for index in 0..piece_count {
            let piece = self
                .verified
                .get(&index)
                .ok_or(Error::InvalidPieceIndex(index))?;
            tmp.write_all(piece).await?;
        }
        tmp.flush().await?;
        tmp.sync_all().await?;
        drop(tmp);

        fs::rename(&tmp_path, &self.output_path).await?;
        match fs::remove_file(&self.journal_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        debug_assert_eq!(
            self.total_length,
            fs::metadata(&self.output_path).await?.len()
        );
        Ok(())
    }
}

/// Parses one `(index, length, payload)` record off the front of `cursor`,
/// advancing it past the record on success. Returns `None` if fewer bytes
/// remain than a full record requires, which both ends replay cleanly at the
/// journal's true end and discards a partial trailing record left by a
/// crash mid-append.
fn read_record(cursor: &mut &[u8]) -> Option<(PieceIndex, Vec<u8>)> {
    if cursor.len() < 8 {
        return None;
    }
    let index = u32::from_be_bytes(cursor[0..4].try_into().unwrap()) as PieceIndex;
    let len = u32::from_be_bytes(cursor[4..8].try_into().unwrap()) as usize;
    if cursor.len() < 8 + len {
        return None;
    }
    let payload = cursor[8..8 + len].to_vec();
    *cursor = &cursor[8 + len..];
    Some((index, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn piece_hashes(pieces: &[&[u8]]) -> Vec<u8> {
        pieces
            .iter()
            .flat_map(|p| Sha1::digest(p).to_vec())
            .collect()
    }

    #[tokio::test]
    async fn fresh_store_has_no_verified_pieces() {
        let dir = tempdir().unwrap();
        let metainfo_path = dir.path().join("test.torrent");
        let hashes = piece_hashes(&[&[0u8; 4]]);
        let store = PieceStore::open(
            &metainfo_path,
            dir.path().join("out.bin"),
            hashes,
            4,
        )
        .await
        .unwrap();
        assert_eq!(store.verified_count(), 0);
    }

    #[tokio::test]
    async fn save_then_reopen_resumes_verified_pieces() {
        let dir = tempdir().unwrap();
        let metainfo_path = dir.path().join("test.torrent");
        let piece = vec![7u8; 4];
        let hashes = piece_hashes(&[&piece]);

        let mut store = PieceStore::open(
            &metainfo_path,
            dir.path().join("out.bin"),
            hashes.clone(),
            4,
        )
        .await
        .unwrap();
        assert!(store.matches_hash(0, &piece));
        store.save(0, piece.clone()).await.unwrap();
        drop(store);

        let resumed = PieceStore::open(
            &metainfo_path,
            dir.path().join("out.bin"),
            hashes,
            4,
        )
        .await
        .unwrap();
        assert_eq!(resumed.verified_count(), 1);
        assert!(resumed.is_verified(0));
    }

    #[tokio::test]
    async fn corrupt_trailing_record_is_discarded() {
        let dir = tempdir().unwrap();
        let metainfo_path = dir.path().join("test.torrent");
        let piece = vec![1u8; 4];
        let hashes = piece_hashes(&[&piece, &piece]);

        let mut journal_path = metainfo_path.as_os_str().to_owned();
        journal_path.push(".state");
        let journal_path = PathBuf::from(journal_path);

        // one good record, followed by a truncated second record
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&4u32.to_be_bytes());
        bytes.extend_from_slice(&piece);
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&4u32.to_be_bytes());
        bytes.extend_from_slice(&piece[..2]); // truncated payload
        fs::write(&journal_path, &bytes).await.unwrap();

        let store = PieceStore::open(
            &metainfo_path,
            dir.path().join("out.bin"),
            hashes,
            8,
        )
        .await
        .unwrap();
        assert_eq!(store.verified_count(), 1);
        assert!(store.is_verified(0));
        assert!(!store.is_verified(1));
    }

    #[tokio::test]
    async fn finalize_concatenates_pieces_in_order_and_deletes_journal() {
        let dir = tempdir().unwrap();
        let metainfo_path = dir.path().join("test.torrent");
        let output_path = dir.path().join("out.bin");
        let piece0 = vec![1u8; 4];
        let piece1 = vec![2u8; 4];
        let hashes = piece_hashes(&[&piece0, &piece1]);

        let mut store = PieceStore::open(&metainfo_path, output_path.clone(), hashes, 8)
            .await
            .unwrap();
        store.save(1, piece1.clone()).await.unwrap();
        store.save(0, piece0.clone()).await.unwrap();
        store.finalize(2).await.unwrap();

        let contents = fs::read(&output_path).await.unwrap();
        assert_eq!(contents, [piece0, piece1].concat());

        let mut journal_path = metainfo_path.as_os_str().to_owned();
        journal_path.push(".state");
        assert!(!PathBuf::from(journal_path).exists());
    }
}
