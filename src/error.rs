//! Error types returned by the engine and its parts.
//!
//! Per-peer failures (see the variants documented as such) never propagate
//! past a peer session: the session logs the error and closes, and the
//! engine continues with its remaining sessions.

use std::fmt;

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors that may occur in the engine and its parts.
#[derive(Debug)]
pub enum Error {
    /// Connecting to a peer failed or timed out. Per-peer, not fatal.
    ConnectFailed(std::io::Error),
    /// The peer's handshake didn't carry our info hash. Per-peer, not fatal.
    HandshakeMismatch,
    /// A peer sent a malformed message: a body shorter than its message type
    /// requires, or a length exceeding the sanity cap. Per-peer, not fatal.
    Protocol(String),
    /// A connect, handshake, or read deadline elapsed. Per-peer, not fatal.
    Timeout,
    /// The peer choked us mid-fetch, so the in-progress piece was abandoned.
    /// Per-peer, not fatal.
    PeerChoked,
    /// A downloaded piece's hash didn't match the expected digest. The piece
    /// is discarded and released back to the scheduler. Not fatal.
    HashMismatch(crate::PieceIndex),
    /// The resume journal contained a corrupt or partial trailing record. The
    /// journal is truncated at the last good record. Not fatal.
    JournalCorrupt,
    /// The given piece index doesn't exist in this torrent.
    InvalidPieceIndex(crate::PieceIndex),
    /// The metainfo bytes couldn't be parsed, or were missing a required
    /// field.
    InvalidMetainfo(String),
    /// An I/O failure that prevents the download from proceeding at all
    /// (can't open the output file, can't read the metainfo file, etc).
    /// Fatal: surfaced to the caller as a failed download.
    IoFatal(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed(e) => write!(f, "failed to connect to peer: {}", e),
            Self::HandshakeMismatch => write!(f, "peer handshake info hash mismatch"),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Timeout => write!(f, "operation timed out"),
            Self::PeerChoked => write!(f, "peer choked us mid-fetch"),
            Self::HashMismatch(index) => {
                write!(f, "piece {} failed hash verification", index)
            }
            Self::JournalCorrupt => write!(f, "resume journal contains a corrupt record"),
            Self::InvalidPieceIndex(index) => {
                write!(f, "piece index {} is out of range", index)
            }
            Self::InvalidMetainfo(msg) => write!(f, "invalid metainfo: {}", msg),
            Self::IoFatal(e) => write!(f, "fatal I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConnectFailed(e) | Self::IoFatal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    /// Conservatively maps a bare I/O error to the fatal variant. Call sites
    /// that know the error is peer-local (e.g. a socket read) should
    /// construct the appropriate per-peer variant directly instead of relying
    /// on this conversion.
    fn from(e: std::io::Error) -> Self {
        Self::IoFatal(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::InvalidMetainfo(e.to_string())
    }
}
