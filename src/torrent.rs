use crate::metainfo::MetaInfo;
use crate::peer::connection::Connection;
use crate::storage::{StorageWork, StorageWorker};
use crate::tracker::http::Tracker;
use crate::tracker::peers::Peer;
use crate::utils;
use anyhow::{anyhow, bail, Context, Result};
use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use sha1::{Digest, Sha1};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A worker hangs up once it has burned through this many failed jobs.
const MAX_PEER_FAILURES: u32 = 3;
/// Cap on concurrently attached peers, so a hostile tracker response
/// cannot exhaust sockets.
const MAX_WORKERS: usize = 30;
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(20);
const ATTACH_INTERVAL: Duration = Duration::from_secs(1);
const QUEUE_POLL: Duration = Duration::from_secs(1);
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

struct PieceWork {
    index: usize,
    hash: [u8; 20],
    length: usize,
}

struct PieceResult {
    index: usize,
    buf: Vec<u8>,
}

struct PeerEntry {
    peer: Peer,
    /// true while a worker thread is attached to this address
    active: bool,
}

type Registry = Arc<Mutex<Vec<PeerEntry>>>;

/// The download coordinator: owns the work queue, the result channel, and
/// the peer registry; everything else gets channel ends and Arcs.
pub struct Torrent {
    pub meta: MetaInfo,
    pub peer_id: [u8; 20],
    trackers: Vec<Tracker>,
}

impl Torrent {
    pub fn new(meta: MetaInfo) -> Result<Torrent> {
        let peer_id = utils::generate_peer_id();
        let mut trackers = Vec::new();
        for announce in &meta.announce {
            match Tracker::new(announce, meta.length as u64, meta.info_hash, peer_id) {
                Ok(tracker) => trackers.push(tracker),
                Err(err) => warn!("skipping tracker {}: {}", announce, err),
            }
        }
        if trackers.is_empty() {
            bail!("no usable tracker in announce list");
        }
        Ok(Torrent {
            meta,
            peer_id,
            trackers,
        })
    }

    /// Runs the whole download and returns once every piece is verified on
    /// disk. Output lands under `out_dir` per the torrent's layout.
    pub fn download(self, out_dir: &Path) -> Result<()> {
        let Torrent {
            meta,
            peer_id,
            trackers,
        } = self;
        let piece_count = meta.piece_count();
        let info_hash = meta.info_hash;

        let root = meta.output_root(out_dir);
        let (storage_worker, storage) =
            StorageWorker::new(&root, &meta.files).context("failed to set up output files")?;
        let storage_thread = thread::spawn(move || storage_worker.run());

        let (work_tx, work_rx) = bounded::<PieceWork>(piece_count);
        let (result_tx, result_rx) = unbounded::<PieceResult>();
        for (index, hash) in meta.piece_hashes.iter().enumerate() {
            let (begin, end) = piece_bounds(index, meta.piece_length, meta.length);
            work_tx
                .send(PieceWork {
                    index,
                    hash: *hash,
                    length: end - begin,
                })
                .expect("work queue is sized to the piece count");
        }

        let registry: Registry = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        // first announce round is synchronous: with every tracker down
        // there is nothing to download from and that is fatal
        let mut reached = false;
        for tracker in &trackers {
            match tracker.request_peers() {
                Ok(peers) => {
                    reached = true;
                    let added = merge_peers(&registry, &peers);
                    debug!("tracker {}: {} new peers", tracker.announce, added);
                }
                Err(err) => warn!("tracker {} failed: {}", tracker.announce, err),
            }
        }
        if !reached {
            bail!("all trackers failed on first announce");
        }

        info!("download started: {} ({} pieces)", meta.name, piece_count);

        let refresher = {
            let registry = Arc::clone(&registry);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || refresh_trackers(trackers, registry, shutdown))
        };
        let attacher = {
            let registry = Arc::clone(&registry);
            let shutdown = Arc::clone(&shutdown);
            let work_tx = work_tx.clone();
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            thread::spawn(move || {
                attach_peers(
                    registry, shutdown, peer_id, info_hash, work_tx, work_rx, result_tx,
                )
            })
        };

        // result collection: the only writer of the done counter
        let mut downloaded = 0usize;
        while downloaded < piece_count {
            let res = result_rx
                .recv()
                .map_err(|_| anyhow!("result channel closed before completion"))?;
            let offset = res.index as u64 * meta.piece_length as u64;
            storage
                .queue
                .send(StorageWork {
                    data: res.buf,
                    offset,
                })
                .map_err(|_| anyhow!("storage worker is gone"))?;
            downloaded += 1;

            let percent = downloaded as f64 / piece_count as f64 * 100.0;
            let workers = registry
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.active)
                .count();
            info!(
                "downloaded {:5.1}% ({}/{} pieces) - peers: {}",
                percent, downloaded, piece_count, workers
            );
        }

        shutdown.store(true, Ordering::Relaxed);
        let _ = storage.exit.send(());
        storage_thread
            .join()
            .map_err(|_| anyhow!("storage worker panicked"))?
            .context("output verification failed")?;

        // workers unwind on their own; these two are quick to notice
        let _ = refresher.join();
        let _ = attacher.join();

        info!("download complete: {}", root.display());
        Ok(())
    }
}

fn piece_bounds(index: usize, piece_length: usize, total: usize) -> (usize, usize) {
    let begin = index * piece_length;
    let end = (begin + piece_length).min(total);
    (begin, end)
}

/// Appends peers not already known to the registry, keyed by ip:port.
/// Returns how many were new.
fn merge_peers(registry: &Registry, found: &[Peer]) -> usize {
    let mut reg = registry.lock().unwrap();
    let mut added = 0;
    for peer in found {
        if !reg.iter().any(|entry| entry.peer == *peer) {
            reg.push(PeerEntry {
                peer: *peer,
                active: false,
            });
            added += 1;
        }
    }
    added
}

/// Re-announces to every tracker on a fixed cadence, feeding new addresses
/// into the registry. Tracker failures are logged and retried next round.
fn refresh_trackers(trackers: Vec<Tracker>, registry: Registry, shutdown: Arc<AtomicBool>) {
    loop {
        let round_start = Instant::now();
        while round_start.elapsed() < ANNOUNCE_INTERVAL {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(SHUTDOWN_POLL);
        }
        for tracker in &trackers {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            match tracker.request_peers() {
                Ok(peers) => {
                    let added = merge_peers(&registry, &peers);
                    if added > 0 {
                        debug!("tracker {}: {} new peers", tracker.announce, added);
                    }
                }
                Err(err) => warn!("tracker {} failed: {}", tracker.announce, err),
            }
        }
    }
}

/// Scans the registry and attaches a worker to every inactive address,
/// up to the worker cap. Workers clear their own flag on exit, which
/// makes the address eligible again.
#[allow(clippy::too_many_arguments)]
fn attach_peers(
    registry: Registry,
    shutdown: Arc<AtomicBool>,
    peer_id: [u8; 20],
    info_hash: [u8; 20],
    work_tx: Sender<PieceWork>,
    work_rx: Receiver<PieceWork>,
    result_tx: Sender<PieceResult>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let fresh: Vec<Peer> = {
            let mut reg = registry.lock().unwrap();
            let mut slots = MAX_WORKERS.saturating_sub(reg.iter().filter(|e| e.active).count());
            let mut fresh = Vec::new();
            for entry in reg.iter_mut().filter(|entry| !entry.active) {
                if slots == 0 {
                    break;
                }
                entry.active = true;
                fresh.push(entry.peer);
                slots -= 1;
            }
            fresh
        };

        for peer in fresh {
            let registry = Arc::clone(&registry);
            let shutdown = Arc::clone(&shutdown);
            let work_tx = work_tx.clone();
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            thread::spawn(move || {
                run_worker(
                    peer, peer_id, info_hash, &work_tx, &work_rx, &result_tx, &shutdown,
                );
                deactivate(&registry, peer);
            });
        }
        thread::sleep(ATTACH_INTERVAL);
    }
}

fn deactivate(registry: &Registry, peer: Peer) {
    let mut reg = registry.lock().unwrap();
    if let Some(entry) = reg.iter_mut().find(|entry| entry.peer == peer) {
        entry.active = false;
    }
}

/// One peer worker: open a session, then pull piece jobs until the peer
/// stops being useful. Every failure path puts the job back before the
/// failure is counted, so no piece can be lost.
fn run_worker(
    peer: Peer,
    peer_id: [u8; 20],
    info_hash: [u8; 20],
    work_tx: &Sender<PieceWork>,
    work_rx: &Receiver<PieceWork>,
    result_tx: &Sender<PieceResult>,
    shutdown: &AtomicBool,
) {
    let mut conn = match Connection::connect(peer, peer_id, info_hash) {
        Ok(conn) => conn,
        Err(err) => {
            debug!("could not open session with {}: {}", peer, err);
            return;
        }
    };
    debug!("session open with {}", peer);

    let mut failures = 0u32;
    while !shutdown.load(Ordering::Relaxed) && failures <= MAX_PEER_FAILURES {
        let work = match work_rx.recv_timeout(QUEUE_POLL) {
            Ok(work) => work,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if !conn.bitfield.has_piece(work.index) {
            debug!("{} does not have piece {}, putting back in queue", peer, work.index);
            let _ = work_tx.send(work);
            failures += 1;
            continue;
        }

        let index = work.index;
        let buf = match conn.download_piece(index as u32, work.length) {
            Ok(buf) => buf,
            Err(err) => {
                debug!("piece {} from {} failed, putting back in queue: {}", index, peer, err);
                let _ = work_tx.send(work);
                failures += 1;
                continue;
            }
        };

        let digest: [u8; 20] = Sha1::digest(&buf).into();
        if digest != work.hash {
            debug!("piece {} from {} failed hash check, putting back in queue", index, peer);
            let _ = work_tx.send(work);
            failures += 1;
            continue;
        }

        if let Err(err) = conn.send_have(index as u32) {
            debug!("could not send Have({}) to {}: {}", index, peer, err);
        }
        if result_tx.send(PieceResult { index, buf }).is_err() {
            break;
        }
    }

    debug!("disconnecting from {}", peer);
    conn.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer(last_octet: u8, port: u16) -> Peer {
        Peer {
            ip: Ipv4Addr::new(192, 168, 1, last_octet),
            port,
        }
    }

    #[test]
    fn piece_bounds_clamps_last_piece() {
        assert_eq!(piece_bounds(5, 70, 400), (350, 400));
        assert_eq!(piece_bounds(5, 70, 420), (350, 420));
        assert_eq!(piece_bounds(4, 100, 450), (400, 450));
        assert_eq!(piece_bounds(0, 100, 450), (0, 100));
    }

    #[test]
    fn merge_peers_appends_only_new() {
        let registry: Registry = Arc::new(Mutex::new(vec![
            PeerEntry {
                peer: peer(0, 1337),
                active: false,
            },
            PeerEntry {
                peer: peer(1, 1337),
                active: true,
            },
        ]));

        // full overlap adds nothing
        assert_eq!(merge_peers(&registry, &[peer(0, 1337), peer(1, 1337)]), 0);

        // one known, one new
        assert_eq!(merge_peers(&registry, &[peer(1, 1337), peer(2, 1337)]), 1);

        // same ip on a different port counts as a new peer
        assert_eq!(merge_peers(&registry, &[peer(1, 1338)]), 1);

        let reg = registry.lock().unwrap();
        assert_eq!(reg.len(), 4);
        // appended entries start inactive
        assert!(!reg[2].active);
        assert!(!reg[3].active);
    }

    #[test]
    fn deactivate_clears_the_flag() {
        let registry: Registry = Arc::new(Mutex::new(vec![PeerEntry {
            peer: peer(7, 6881),
            active: true,
        }]));
        deactivate(&registry, peer(7, 6881));
        assert!(!registry.lock().unwrap()[0].active);
    }
}
