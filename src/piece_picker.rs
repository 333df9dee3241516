//! The piece scheduler: decides which piece a peer session should fetch
//! next, out of the pieces the torrent is still missing.
//!
//! A single `Scheduler` is shared (via `Arc`) across every peer session in
//! the swarm, guarded by one [`tokio::sync::Mutex`], mirroring the way the
//! engine shares a single piece picker across its peer sessions. Pieces are
//! claimed rarest-available-first is not implemented here (the spec only
//! requires avoiding duplicate work); claiming simply prefers pieces no one
//! else is fetching, and falls back to endgame duplication once few enough
//! pieces remain.

use tokio::sync::Mutex;

use crate::{Bitfield, PieceIndex};

struct State {
    /// Pieces whose hash has already been verified and written out.
    verified: Bitfield,
    /// Pieces some peer session currently holds a claim on.
    in_flight: Bitfield,
    piece_count: usize,
}

/// Coordinates which piece each peer session is allowed to work on, so that
/// under normal conditions no two sessions fetch the same piece at once.
pub(crate) struct Scheduler {
    state: Mutex<State>,
}

impl Scheduler {
    /// Creates a scheduler for a torrent with `piece_count` pieces, where
    /// `verified` marks the pieces already on disk (e.g. recovered from the
    /// resume journal at startup).
    pub fn new(piece_count: usize, verified: Bitfield) -> Self {
        debug_assert_eq!(verified.len(), piece_count);
        Self {
            state: Mutex::new(State {
                verified,
                in_flight: Bitfield::repeat(false, piece_count),
                piece_count,
            }),
        }
    }

    /// Claims a piece this session should fetch next, preferring one the
    /// peer has (per `peer_has`) that's neither verified nor already
    /// in flight. If every missing piece is in flight, and no fewer than
    /// `endgame_threshold` pieces remain unverified, a piece already in
    /// flight is claimed again (the "endgame"), to avoid one slow peer
    /// stalling the whole download's tail.
    pub async fn claim(&self, peer_has: &Bitfield, endgame_threshold: usize) -> Option<PieceIndex> {
        let mut state = self.state.lock().await;

        for index in 0..state.piece_count {
            let has = peer_has.get(index).map(|b| *b).unwrap_or(false);
            if has && !state.verified[index] && !state.in_flight[index] {
                state.in_flight.set(index, true);
                return Some(index);
            }
        }

        let missing = state.piece_count - state.verified.count_ones();
        if missing <= endgame_threshold && missing > 0 {
            for index in 0..state.piece_count {
                let has = peer_has.get(index).map(|b| *b).unwrap_or(false);
                if has && !state.verified[index] {
                    // already in flight elsewhere, claimed again regardless
                    return Some(index);
                }
            }
        }

        None
    }

    /// Releases a claim without marking the piece verified, e.g. when the
    /// session abandons the piece on choke or disconnect, or the piece
    /// failed hash verification.
    pub async fn release(&self, index: PieceIndex) {
        let mut state = self.state.lock().await;
        state.in_flight.set(index, false);
    }

    /// Marks a piece verified and no longer in flight.
    pub async fn mark_verified(&self, index: PieceIndex) {
        let mut state = self.state.lock().await;
        state.verified.set(index, true);
        state.in_flight.set(index, false);
    }

    pub async fn is_complete(&self) -> bool {
        let state = self.state.lock().await;
        state.verified.count_ones() == state.piece_count
    }

    /// Returns the fraction of pieces verified so far, in `[0.0, 1.0]`.
    pub async fn progress(&self) -> f64 {
        let state = self.state.lock().await;
        if state.piece_count == 0 {
            return 1.0;
        }
        state.verified.count_ones() as f64 / state.piece_count as f64
    }

    pub async fn verified_bitfield(&self) -> Bitfield {
        let state = self.state.lock().await;
        state.verified.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_true(len: usize) -> Bitfield {
        Bitfield::repeat(true, len)
    }

    #[tokio::test]
    async fn claims_distinct_pieces_under_normal_conditions() {
        let scheduler = Scheduler::new(4, Bitfield::repeat(false, 4));
        let has = all_true(4);
        let a = scheduler.claim(&has, 0).await.unwrap();
        let b = scheduler.claim(&has, 0).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn wont_claim_pieces_the_peer_doesnt_have() {
        let scheduler = Scheduler::new(2, Bitfield::repeat(false, 2));
        let mut has = Bitfield::repeat(false, 2);
        has.set(1, true);
        let claimed = scheduler.claim(&has, 0).await.unwrap();
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn returns_none_when_nothing_left_to_claim_outside_endgame() {
        let scheduler = Scheduler::new(1, Bitfield::repeat(false, 1));
        let has = all_true(1);
        scheduler.claim(&has, 0).await.unwrap();
        assert!(scheduler.claim(&has, 0).await.is_none());
    }

    #[tokio::test]
    async fn endgame_allows_reclaiming_an_in_flight_piece() {
        let scheduler = Scheduler::new(1, Bitfield::repeat(false, 1));
        let has = all_true(1);
        scheduler.claim(&has, 5).await.unwrap();
        assert_eq!(scheduler.claim(&has, 5).await, Some(0));
    }

    #[tokio::test]
    async fn mark_verified_excludes_piece_from_future_claims() {
        let scheduler = Scheduler::new(1, Bitfield::repeat(false, 1));
        scheduler.mark_verified(0).await;
        assert!(scheduler.is_complete().await);
        assert_eq!(scheduler.progress().await, 1.0);
        assert!(scheduler.claim(&all_true(1), 5).await.is_none());
    }

    #[tokio::test]
    async fn release_allows_reclaiming_without_marking_verified() {
        let scheduler = Scheduler::new(1, Bitfield::repeat(false, 1));
        let has = all_true(1);
        scheduler.claim(&has, 0).await.unwrap();
        scheduler.release(0).await;
        assert_eq!(scheduler.claim(&has, 0).await, Some(0));
        assert!(!scheduler.is_complete().await);
    }
}
