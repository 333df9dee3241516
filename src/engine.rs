//! Owns a single torrent download end to end: construction from a metainfo
//! file, spawning the bounded set of peer sessions, the throughput sampler,
//! the progress callback, and finalization.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::conf::{Conf, CLIENT_ID_PREFIX};
use crate::error::Result;
use crate::metainfo::Metainfo;
use crate::peer::{PeerSession, SessionEvent, TorrentInfo};
use crate::piece_picker::Scheduler;
use crate::piece_store::PieceStore;
use crate::{Bitfield, PeerId};

/// A cloneable, cheaply-shared reference to a running engine, used to signal
/// cancellation from outside the task that's awaiting [`Engine::download`].
#[derive(Clone)]
pub struct EngineHandle {
    aborted: Arc<AtomicBool>,
}

impl EngineHandle {
    /// Requests that the download stop as soon as every task observes the
    /// flag. In-flight pieces are discarded; already-verified pieces remain
    /// in the journal for a future resume.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }
}

/// A callback invoked after every newly-verified piece, with the overall
/// progress fraction and a human-readable current throughput.
pub type ProgressCallback = Arc<dyn Fn(f64, &str) + Send + Sync>;

/// Drives a single torrent to completion (or failure) against a fixed list
/// of candidate peers.
pub struct Engine {
    metainfo: Metainfo,
    metainfo_path: PathBuf,
    output_path: PathBuf,
    peers: Vec<SocketAddr>,
    conf: Conf,
    progress_callback: Option<ProgressCallback>,
    aborted: Arc<AtomicBool>,
    client_id: PeerId,
}

impl Engine {
    /// Parses `metainfo_bytes` and prepares a download of it to
    /// `output_path`, to be fetched from `peers`. `metainfo_path` is used
    /// only to derive the resume journal's path (`metainfo_path + ".state"`).
    pub fn new(
        metainfo_bytes: &[u8],
        metainfo_path: PathBuf,
        output_path: PathBuf,
        peers: Vec<SocketAddr>,
        conf: Conf,
    ) -> Result<Self> {
        let metainfo = Metainfo::from_bytes(metainfo_bytes)?;

        let mut client_id = [0u8; 20];
        client_id[..8].copy_from_slice(CLIENT_ID_PREFIX);
        rand::thread_rng().fill_bytes(&mut client_id[8..]);

        Ok(Self {
            metainfo,
            metainfo_path,
            output_path,
            peers,
            conf,
            progress_callback: None,
            aborted: Arc::new(AtomicBool::new(false)),
            client_id,
        })
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Returns a handle that can be used to abort the download from another
    /// task while [`Engine::download`] is running.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            aborted: Arc::clone(&self.aborted),
        }
    }

    /// Runs the download to completion. Returns `true` iff every piece
    /// verified and the output file was finalized; `false` on abort or if
    /// no combination of peers could supply every piece.
    pub async fn download(&self) -> Result<bool> {
        let info_hash = self.metainfo.info_hash()?;
        let piece_count = self.metainfo.piece_count();
        let total_length = self.metainfo.total_length()?;
        let piece_len = self.metainfo.piece_len(0).unwrap_or(0);
        let last_piece_len = self.metainfo.piece_len(piece_count.saturating_sub(1))?;

        log::info!(
            "starting download: info_hash={} pieces={} total_length={}",
            hex::encode(info_hash),
            piece_count,
            total_length
        );

        let piece_hashes = self.metainfo.info.pieces.to_vec();
        let piece_store = PieceStore::open(
            &self.metainfo_path,
            self.output_path.clone(),
            piece_hashes,
            total_length,
        )
        .await?;

        let mut verified = Bitfield::repeat(false, piece_count);
        for &index in piece_store.verified_indices() {
            verified.set(index, true);
        }
        let verified_count = piece_store.verified_count();

        let scheduler = Arc::new(Scheduler::new(piece_count, verified));
        let piece_store = Arc::new(tokio::sync::Mutex::new(piece_store));
        let torrent = Arc::new(TorrentInfo {
            info_hash,
            client_id: self.client_id,
            piece_count,
            piece_len,
            last_piece_len,
        });

        if scheduler.is_complete().await {
            log::info!("resume journal already complete, finalizing immediately");
            self.report_progress(1.0, 0);
            piece_store.lock().await.finalize(piece_count).await?;
            return Ok(true);
        }

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SessionEvent>();

        let max_peers = self.conf.engine.max_peers.min(self.peers.len());
        let mut sessions: Vec<JoinHandle<()>> = Vec::with_capacity(max_peers);
        for &addr in self.peers.iter().take(max_peers) {
            let torrent = Arc::clone(&torrent);
            let scheduler = Arc::clone(&scheduler);
            let piece_store = Arc::clone(&piece_store);
            let events = event_tx.clone();
            let aborted = Arc::clone(&self.aborted);
            let conf = self.conf.torrent;
            sessions.push(tokio::spawn(async move {
                let mut session =
                    PeerSession::new(torrent, scheduler, piece_store, events, aborted, conf, addr);
                if let Err(e) = session.start().await {
                    log::info!("peer {} session ended: {}", addr, e);
                }
            }));
        }
        // the channel's last sender lives in each spawned session; dropping
        // this one just means the channel closes once they all exit
        drop(event_tx);

        let downloaded_this_period = Arc::new(AtomicU64::new(0));
        let current_speed = Arc::new(AtomicU64::new(0));
        let sampler = self.spawn_sampler(
            Arc::clone(&downloaded_this_period),
            Arc::clone(&current_speed),
        );

        let mut verified_count = verified_count;
        loop {
            if verified_count == piece_count {
                break;
            }
            if self.aborted.load(Ordering::Relaxed) {
                break;
            }

            match tokio::time::timeout(Duration::from_secs(1), event_rx.recv()).await {
                Ok(Some(SessionEvent::BytesDownloaded { len })) => {
                    downloaded_this_period.fetch_add(len, Ordering::Relaxed);
                }
                Ok(Some(SessionEvent::PieceVerified { .. })) => {
                    verified_count += 1;
                    let fraction = verified_count as f64 / piece_count as f64;
                    self.report_progress(fraction, current_speed.load(Ordering::Relaxed));
                }
                Ok(None) => {
                    // every session has exited; nothing left to drive
                    // further progress
                    break;
                }
                Err(_) => {
                    // timed out waiting for an event; loop back around to
                    // re-check completion/abort
                }
            }
        }

        let completed_without_abort = verified_count == piece_count;

        self.aborted.store(true, Ordering::Relaxed);
        sampler.abort();
        for session in sessions {
            // a peer session task never panics in normal operation; join
            // errors here are from cancellation, which is expected and
            // swallowed
            let _ = session.await;
        }

        if completed_without_abort {
            debug_assert!(scheduler.is_complete().await);
            piece_store.lock().await.finalize(piece_count).await?;
            log::info!("download complete, output finalized");
            Ok(true)
        } else {
            log::info!(
                "download ended incomplete ({}/{} pieces)",
                verified_count, piece_count
            );
            Ok(false)
        }
    }

    fn spawn_sampler(
        &self,
        downloaded_this_period: Arc<AtomicU64>,
        current_speed: Arc<AtomicU64>,
    ) -> JoinHandle<()> {
        let sample_interval = self.conf.engine.sample_interval;
        let aborted = Arc::clone(&self.aborted);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sample_interval).await;
                if aborted.load(Ordering::Relaxed) {
                    break;
                }
                let bytes = downloaded_this_period.swap(0, Ordering::Relaxed);
                let per_second = bytes as f64 / sample_interval.as_secs_f64();
                current_speed.store(per_second as u64, Ordering::Relaxed);
            }
        })
    }

    fn report_progress(&self, fraction: f64, speed_bytes_per_sec: u64) {
        if let Some(callback) = &self.progress_callback {
            callback(fraction, &format_speed(speed_bytes_per_sec));
        }
    }
}

/// Formats a byte rate the way the engine's progress callback expects:
/// kilobytes per second up to 1 MiB/s, megabytes per second beyond that.
fn format_speed(bytes_per_sec: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    let bytes_per_sec = bytes_per_sec as f64;
    if bytes_per_sec <= MIB {
        format!("{:.2} KB/s", bytes_per_sec / KIB)
    } else {
        format!("{:.2} MB/s", bytes_per_sec / MIB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_kilobytes_below_one_mebibyte_per_second() {
        assert_eq!(format_speed(512 * 1024), "512.00 KB/s");
    }

    #[test]
    fn formats_megabytes_above_one_mebibyte_per_second() {
        let formatted = format_speed(5 * 1024 * 1024);
        assert_eq!(formatted, "5.00 MB/s");
    }
}
