//! Tracks the block-level progress of a single piece while it is being
//! fetched from one peer.
//!
//! A peer session works on at most one piece at a time (see §4.2): it asks
//! [`crate::piece_picker::Scheduler`] for a piece index, builds a
//! `PieceDownload` for it, and drives it to completion (or abandons it, on
//! choke or disconnect) before asking for the next one.

use crate::{block_count, block_len, BlockInfo, PieceIndex};

/// The state of one block within the piece currently being downloaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockState {
    Missing,
    Requested,
    Received,
}

/// Tracks which blocks of a single piece have been requested and received.
pub(crate) struct PieceDownload {
    piece_index: PieceIndex,
    piece_len: u32,
    blocks: Vec<BlockState>,
}

impl PieceDownload {
    pub fn new(piece_index: PieceIndex, piece_len: u32) -> Self {
        let block_count = block_count(piece_len);
        Self {
            piece_index,
            piece_len,
            blocks: vec![BlockState::Missing; block_count],
        }
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.piece_index
    }

    /// Returns up to `count` blocks not yet requested, marking them as
    /// requested as they're picked.
    pub fn pick_blocks(&mut self, count: usize) -> Vec<BlockInfo> {
        let mut picked = Vec::with_capacity(count);
        for (index, state) in self.blocks.iter_mut().enumerate() {
            if picked.len() == count {
                break;
            }
            if *state == BlockState::Missing {
                *state = BlockState::Requested;
                let offset = index as u32 * crate::BLOCK_LEN;
                let len = block_len(self.piece_len, index);
                picked.push(BlockInfo {
                    piece_index: self.piece_index,
                    offset,
                    len,
                });
            }
        }
        picked
    }

    /// Marks the block at `offset` as received. Returns `false` if the offset
    /// doesn't line up with a known block (the peer sent a bogus or
    /// already-cancelled block), in which case the caller should ignore the
    /// data rather than panic.
    pub fn received_block(&mut self, offset: u32) -> bool {
        let index = (offset / crate::BLOCK_LEN) as usize;
        match self.blocks.get_mut(index) {
            Some(state) => {
                *state = BlockState::Received;
                true
            }
            None => false,
        }
    }

    /// Releases every block that was requested but never received, so a
    /// subsequent `pick_blocks` call can re-request them. Used when the peer
    /// chokes us mid-fetch.
    pub fn cancel_all_requested(&mut self) {
        for state in &mut self.blocks {
            if *state == BlockState::Requested {
                *state = BlockState::Missing;
            }
        }
    }

    pub fn count_missing_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|s| **s == BlockState::Missing)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|s| *s == BlockState::Received)
    }
}
