//! A single peer connection: handshake, choke/interest state, bitfield
//! tracking, and block request pipelining for one piece at a time.
//!
//! Unlike a full client, this engine only ever downloads: it never seeds, so
//! `Interested`, `Request`, and `Cancel` messages arriving from the peer are
//! logged and ignored rather than acted upon, and the peer is not required
//! to be a seed (it only needs to have the pieces this session ends up
//! requesting).

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedParts};

type Sink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

use crate::codec::{Handshake, HandshakeCodec, Message, PeerCodec, PROTOCOL_STRING};
use crate::conf::TorrentConf;
use crate::error::{Error, Result};
use crate::piece_download::PieceDownload;
use crate::piece_picker::Scheduler;
use crate::piece_store::PieceStore;
use crate::{Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// Shared, read-mostly information about the torrent every peer session
/// needs, handed out by the engine to each session it spawns.
pub(crate) struct TorrentInfo {
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub piece_count: usize,
    pub piece_len: u32,
    pub last_piece_len: u32,
}

impl TorrentInfo {
    fn piece_len(&self, index: PieceIndex) -> u32 {
        if index + 1 == self.piece_count {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }
}

/// Notifications a peer session sends back to the engine as the download
/// progresses. The engine uses these to drive the progress callback and the
/// throughput sampler without each session needing to know about either.
pub(crate) enum SessionEvent {
    /// `len` new block bytes arrived, whether or not they end up verifying.
    BytesDownloaded { len: u64 },
    /// A piece finished downloading, passed hash verification, and was
    /// durably appended to the journal.
    PieceVerified { index: PieceIndex },
}

pub(crate) struct PeerSession {
    torrent: Arc<TorrentInfo>,
    scheduler: Arc<Scheduler>,
    piece_store: Arc<Mutex<PieceStore>>,
    events: tokio::sync::mpsc::UnboundedSender<SessionEvent>,
    aborted: Arc<std::sync::atomic::AtomicBool>,
    conf: TorrentConf,
    addr: SocketAddr,
    status: Status,
    download: Option<PieceDownload>,
    outgoing_requests: Vec<BlockInfo>,
    /// The in-progress piece's block data, keyed by offset, filled in as
    /// blocks arrive and drained once the piece completes.
    piece_buf: Vec<u8>,
}

impl PeerSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        torrent: Arc<TorrentInfo>,
        scheduler: Arc<Scheduler>,
        piece_store: Arc<Mutex<PieceStore>>,
        events: tokio::sync::mpsc::UnboundedSender<SessionEvent>,
        aborted: Arc<std::sync::atomic::AtomicBool>,
        conf: TorrentConf,
        addr: SocketAddr,
    ) -> Self {
        Self {
            torrent,
            scheduler,
            piece_store,
            events,
            aborted,
            conf,
            addr,
            status: Status::default(),
            download: None,
            outgoing_requests: Vec::new(),
            piece_buf: Vec::new(),
        }
    }

    /// Runs the session to completion: connects, handshakes, and drives the
    /// message loop until the peer disconnects, a protocol or I/O error
    /// occurs, or the engine sets the abort flag. Errors are per-peer: the
    /// caller logs them and simply drops this session, the download
    /// continues with its remaining peers.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("connecting to peer {}", self.addr);
        let socket = timeout(self.conf.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::ConnectFailed)?;
        log::info!("connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);
        let handshake = Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        timeout(self.conf.handshake_timeout, socket.send(handshake))
            .await
            .map_err(|_| Error::Timeout)??;

        let peer_handshake = timeout(self.conf.handshake_timeout, socket.next())
            .await
            .map_err(|_| Error::Timeout)?
            .ok_or(Error::Timeout)??;
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());
        if peer_handshake.info_hash != self.torrent.info_hash {
            log::info!("peer {} sent mismatched info hash", self.addr);
            return Err(Error::HandshakeMismatch);
        }

        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.run(socket).await
    }

    async fn run(&mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        let (mut sink, mut stream) = socket.split();

        // send interested right away rather than waiting for a bitfield: a
        // peer is free to advertise its pieces purely through `have`
        // messages, never sending a bitfield at all
        sink.send(Message::Interested).await?;
        self.status.is_interested = true;

        loop {
            if self.aborted.load(Ordering::Relaxed) {
                log::debug!("peer {} session observed abort", self.addr);
                break;
            }

            let next = timeout(self.conf.read_timeout, stream.next()).await;
            let msg = match next {
                Ok(Some(msg)) => msg.map_err(|e| Error::Protocol(e.to_string()))?,
                Ok(None) => {
                    log::info!("peer {} closed the connection", self.addr);
                    break;
                }
                Err(_) => {
                    if self.status.is_choked {
                        // a peer with nothing to offer us yet is allowed to
                        // stay quiet; treat the elapsed read merely as a
                        // chance to re-check the abort flag, not a failure
                        tokio::time::sleep(self.conf.choke_backoff).await;
                        continue;
                    }
                    return Err(Error::Timeout);
                }
            };

            self.handle_msg(&mut sink, msg).await?;
        }

        self.abandon_in_progress_download().await;
        Ok(())
    }

    async fn handle_msg(&mut self, sink: &mut Sink, msg: Message) -> Result<()> {
        match msg {
            Message::KeepAlive | Message::Unknown => {}
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    self.outgoing_requests.clear();
                    if let Some(download) = &mut self.download {
                        download.cancel_all_requested();
                    }
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested | Message::Request(_) | Message::Cancel(_) => {
                // this engine never seeds; these are simply acknowledged by
                // being ignored
            }
            Message::NotInterested => {}
            Message::Have { piece_index } => {
                let peer_has = self
                    .status
                    .peer_has
                    .get_or_insert_with(|| Bitfield::repeat(false, self.torrent.piece_count));
                if piece_index < peer_has.len() {
                    peer_has.set(piece_index, true);
                }
                self.make_requests(sink).await?;
            }
            Message::Bitfield(mut bitfield) => {
                bitfield.resize(self.torrent.piece_count, false);
                log::info!("peer {} sent bitfield", self.addr);
                self.status.peer_has = Some(bitfield);
                self.make_requests(sink).await?;
            }
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                let len = data.len() as u64;
                self.handle_piece_msg(piece_index, offset, data).await?;
                let _ = self.events.send(SessionEvent::BytesDownloaded { len });
                self.make_requests(sink).await?;
            }
        }
        Ok(())
    }

    /// Fills the outstanding request pipeline up to `max_pipelined_requests`,
    /// picking a new piece from the scheduler if the session isn't currently
    /// working on one.
    async fn make_requests(&mut self, sink: &mut Sink) -> Result<()> {
        if self.status.is_choked || !self.status.is_interested {
            return Ok(());
        }

        let peer_has = match &self.status.peer_has {
            Some(b) => b.clone(),
            None => return Ok(()),
        };

        loop {
            let to_request = self
                .conf
                .max_pipelined_requests
                .saturating_sub(self.outgoing_requests.len());
            if to_request == 0 {
                break;
            }

            if self.download.is_none() {
                let index = self
                    .scheduler
                    .claim(&peer_has, self.conf.endgame_threshold)
                    .await;
                match index {
                    Some(index) => {
                        log::info!("peer {} picked piece {}", self.addr, index);
                        let piece_len = self.torrent.piece_len(index);
                        self.piece_buf = vec![0; piece_len as usize];
                        self.download = Some(PieceDownload::new(index, piece_len));
                    }
                    None => break,
                }
            }

            let download = self.download.as_mut().unwrap();
            let picked = download.pick_blocks(to_request);
            if picked.is_empty() {
                // every block in this piece has already been requested;
                // wait for the outstanding ones to arrive
                break;
            }
            for block in &picked {
                sink.send(Message::Request(*block)).await?;
            }
            self.outgoing_requests.extend(picked);
        }

        Ok(())
    }

    async fn handle_piece_msg(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let pos = self
            .outgoing_requests
            .iter()
            .position(|b| b.piece_index == piece_index && b.offset == offset);
        let pos = match pos {
            Some(pos) => pos,
            None => {
                log::warn!("peer {} sent an unrequested block", self.addr);
                return Ok(());
            }
        };
        self.outgoing_requests.remove(pos);

        let download = match &mut self.download {
            Some(d) if d.piece_index() == piece_index => d,
            _ => {
                log::warn!("peer {} sent a block for a piece we aren't fetching", self.addr);
                return Ok(());
            }
        };

        if !download.received_block(offset) {
            return Ok(());
        }

        let start = offset as usize;
        self.piece_buf[start..start + data.len()].copy_from_slice(&data);

        if download.is_complete() {
            let piece_index = download.piece_index();
            self.download = None;
            let piece_bytes = std::mem::take(&mut self.piece_buf);

            let mut store = self.piece_store.lock().await;
            if store.is_verified(piece_index) {
                // another session already verified and journaled this index
                // during endgame duplication; discard silently, per §4.4
                drop(store);
                self.scheduler.release(piece_index).await;
            } else if store.matches_hash(piece_index, &piece_bytes) {
                store.save(piece_index, piece_bytes).await?;
                drop(store);
                self.scheduler.mark_verified(piece_index).await;
                log::info!("piece {} verified via peer {}", piece_index, self.addr);
                let _ = self
                    .events
                    .send(SessionEvent::PieceVerified { index: piece_index });
            } else {
                drop(store);
                log::warn!("piece {} failed hash verification", piece_index);
                self.scheduler.release(piece_index).await;
            }
        }

        Ok(())
    }

    /// Releases the in-progress piece claim back to the scheduler so another
    /// session (or a future run) can retry it, e.g. on disconnect or abort.
    async fn abandon_in_progress_download(&mut self) {
        if let Some(download) = self.download.take() {
            self.scheduler.release(download.piece_index()).await;
        }
    }
}

/// The status of a peer session. Both sides of the connection start off
/// choked and not interested.
struct Status {
    is_choked: bool,
    is_interested: bool,
    peer_has: Option<Bitfield>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            is_choked: true,
            is_interested: false,
            peer_has: None,
        }
    }
}
