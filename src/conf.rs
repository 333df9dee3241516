//! This module defines types used to configure the engine and its parts.

use std::time::Duration;

/// The fixed prefix of the client's peer ID, identifying this implementation
/// to other peers, as per the convention described in BEP 20. The remaining
/// 12 bytes are filled in per-session with random data (see
/// [`crate::engine::Engine::new`]).
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-PY0001-";

/// The global configuration for the torrent engine and all its parts.
///
/// `Conf::new` returns sensible defaults for every field; callers typically
/// only override the field or two that matter for their use case (e.g.
/// `max_peers` for a UI that has gathered many more peers than the default).
#[derive(Clone, Copy, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the engine configuration with reasonable defaults.
    pub fn new() -> Self {
        Self {
            engine: EngineConf::default(),
            torrent: TorrentConf::default(),
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Copy, Debug)]
pub struct EngineConf {
    /// The maximum number of peer sessions to run concurrently for a
    /// download. The default is conservative; a UI that has already vetted
    /// a large peer list may want to raise this (e.g. to 30).
    pub max_peers: usize,

    /// How often the throughput sampler recalculates `current_speed`.
    pub sample_interval: Duration,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            max_peers: 5,
            sample_interval: Duration::from_secs(1),
        }
    }
}

/// Configuration for a single peer session's behavior.
#[derive(Clone, Copy, Debug)]
pub struct TorrentConf {
    /// Total deadline for establishing the TCP connection to a peer.
    pub connect_timeout: Duration,

    /// Deadline for sending and receiving the initial handshake.
    pub handshake_timeout: Duration,

    /// Per-read deadline while in the main message loop.
    pub read_timeout: Duration,

    /// How long to sleep between poll attempts while the peer has us choked.
    pub choke_backoff: Duration,

    /// The size of a block, the smallest unit requested over the wire.
    pub block_len: u32,

    /// The maximum number of block requests kept outstanding at once for a
    /// single piece fetch, to bound pipelining without a bandwidth-delay
    /// estimator.
    pub max_pipelined_requests: usize,

    /// The number of unverified pieces remaining below which multiple peers
    /// may be allowed to fetch the same piece concurrently (the "endgame").
    pub endgame_threshold: usize,
}

impl Default for TorrentConf {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            choke_backoff: Duration::from_millis(500),
            block_len: crate::BLOCK_LEN,
            max_pipelined_requests: 16,
            endgame_threshold: 2,
        }
    }
}
