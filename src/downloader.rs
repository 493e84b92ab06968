//! Download orchestration.
//!
//! The downloader resolves peers through the tracker, runs one worker
//! thread per connected peer and one monitor thread, and wires them all
//! to a single shared-state object: the piece store, the active-session
//! list and the control flags, each behind its own mutex.
//!
//! Workers alternate between draining one decoded message from their
//! session into the store and scheduling the next block request from the
//! store's state, with a short bounded sleep between iterations. The
//! monitor reports progress once a second, detects completion, and
//! distinguishes a stalled download (no peers left, pieces still pending)
//! from a finished one.
//!
//! Shutdown is cooperative: the stop path flips the running flag and
//! shuts down every registered socket so blocked reads fail fast and each
//! worker observes the flag on its next iteration.

use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::Result;
use crate::peer::Peer;
use crate::session::PeerSession;
use crate::store::PieceStore;
use crate::torrent::Torrent;
use crate::tracker::Tracker;

/// Bound on each worker's poll rate.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Period of the progress/completion monitor.
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

const PEER_ID_PREFIX: &[u8] = b"-RM0001-";

struct ControlState {
    running: bool,
    /// Connection attempts that have not yet succeeded or failed
    connecting: usize,
}

/// State shared by every worker and the monitor. No globals: one of
/// these is allocated per download and passed by `Arc`.
struct Shared {
    store: Mutex<PieceStore>,
    /// A cloned socket handle per active session, so the stop path can
    /// force in-flight reads to fail
    active: Mutex<Vec<(Peer, TcpStream)>>,
    control: Mutex<ControlState>,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.control.lock().unwrap().running
    }

    /// Idempotent stop: flips the running flag and unblocks every worker
    /// by shutting its socket down.
    fn stop(&self) {
        {
            let mut control = self.control.lock().unwrap();
            if !control.running {
                return;
            }
            control.running = false;
        }

        for (_, stream) in self.active.lock().unwrap().iter() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn connect_finished(&self) {
        let mut control = self.control.lock().unwrap();
        control.connecting = control.connecting.saturating_sub(1);
    }

    /// Snapshot of peer visibility for the monitor: in-flight connection
    /// attempts and registered sessions.
    ///
    /// `connecting` must be read first. A worker registers its session
    /// before decrementing the counter, so observing zero attempts here
    /// guarantees every live session is visible in the `active` read that
    /// follows; the opposite order could miss a session mid-registration
    /// and misreport a stall.
    fn peer_activity(&self) -> (usize, usize) {
        let connecting = self.control.lock().unwrap().connecting;
        let peers = self.active.lock().unwrap().len();
        (connecting, peers)
    }
}

/// Handle for triggering shutdown from outside the download threads
/// (interactive quit, SIGINT).
#[derive(Clone)]
pub struct ShutdownHandle(Arc<Shared>);

impl ShutdownHandle {
    pub fn stop(&self) {
        self.0.stop();
    }
}

/// Coordinates one torrent download from peer discovery to completion.
pub struct Downloader {
    torrent: Torrent,
    peer_id: Vec<u8>,
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl Downloader {
    /// Builds the shared piece store (pre-sizing the output files) and
    /// generates this client's peer id.
    pub fn new(torrent: Torrent, download_dir: &Path) -> Result<Downloader> {
        let store = PieceStore::new(&torrent, download_dir)?;

        Ok(Downloader {
            torrent,
            peer_id: generate_peer_id(),
            shared: Arc::new(Shared {
                store: Mutex::new(store),
                active: Mutex::new(vec![]),
                control: Mutex::new(ControlState {
                    running: true,
                    connecting: 0,
                }),
            }),
            handles: vec![],
        })
    }

    /// Resolves peers and launches the worker and monitor threads.
    pub fn start(&mut self) -> Result<()> {
        let tracker = Tracker::new(&self.torrent, self.peer_id.clone());
        let peers = tracker.discover_peers();
        info!("tracker discovery produced {} candidate peers", peers.len());
        println!("Found {} peers.", peers.len());

        self.shared.control.lock().unwrap().connecting = peers.len();

        for peer in peers {
            let shared = Arc::clone(&self.shared);
            let info_hash = self.torrent.info_hash().to_vec();
            let peer_id = self.peer_id.clone();
            let piece_count = self.torrent.piece_count();

            self.handles.push(thread::spawn(move || {
                run_peer(shared, peer, info_hash, peer_id, piece_count);
            }));
        }

        let shared = Arc::clone(&self.shared);
        let total_size = self.torrent.total_size();
        self.handles.push(thread::spawn(move || {
            run_monitor(shared, total_size);
        }));

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shared))
    }

    /// Waits for every worker and the monitor to exit. Call after
    /// `stop()`; sockets are already shut down so workers unblock fast.
    pub fn join(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.shared.store.lock().unwrap().is_complete()
    }
}

fn generate_peer_id() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut peer_id = PEER_ID_PREFIX.to_vec();
    peer_id.extend((0..12).map(|_| rng.sample(Alphanumeric)));
    peer_id
}

/// Worker thread: one per candidate peer, alive until the session closes
/// or the download stops.
fn run_peer(shared: Arc<Shared>, peer: Peer, info_hash: Vec<u8>, peer_id: Vec<u8>, piece_count: usize) {
    let mut session = match PeerSession::connect(peer, &info_hash, &peer_id, piece_count) {
        Ok(session) => session,
        Err(e) => {
            debug!("could not connect to {}: {}", peer, e);
            shared.connect_finished();
            return;
        }
    };
    info!("connected to peer {}", peer);

    // Register the socket handle so the stop path can reach it
    match session.stream_handle() {
        Ok(handle) => shared.active.lock().unwrap().push((peer, handle)),
        Err(e) => {
            debug!("could not register {}: {}", peer, e);
            shared.connect_finished();
            return;
        }
    }
    shared.connect_finished();

    let mut assigned: Option<u32> = None;
    while shared.is_running() {
        match drive_session(&shared, &mut session, &mut assigned) {
            Ok(()) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                debug!("dropping peer {}: {}", peer, e);
                break;
            }
        }
    }

    session.close();
    if let Some(index) = assigned {
        // Do not strand a claim on a dead connection
        shared.store.lock().unwrap().release_piece(index);
    }
    shared.active.lock().unwrap().retain(|(p, _)| *p != peer);
}

/// One worker iteration: drain a message, then schedule a request.
fn drive_session(
    shared: &Shared,
    session: &mut PeerSession,
    assigned: &mut Option<u32>,
) -> Result<()> {
    if let Some(block) = session.poll_block()? {
        let mut store = shared.store.lock().unwrap();
        store.receive_block(block.piece_index, block.offset, &block.data)?;

        if let Some(index) = *assigned {
            // The claim resolves on verification or on a failed hash check
            if store.is_verified(index) || !store.is_assigned(index) {
                *assigned = None;
            }
        }
    }

    if !session.peer_choking() {
        session.send_interested()?;

        if let Some(remote) = session.bitfield() {
            let mut store = shared.store.lock().unwrap();
            if assigned.is_none() {
                *assigned = store.select_piece_for_peer(remote);
            }
            if let Some(index) = *assigned {
                if let Some((offset, length)) = store.next_block_to_request(index) {
                    drop(store);
                    session.send_request(index, offset, length)?;
                }
            }
        }
    }

    Ok(())
}

/// Monitor thread: progress line, completion detection, stall detection.
fn run_monitor(shared: Arc<Shared>, total_size: u64) {
    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );

    loop {
        if !shared.is_running() {
            return;
        }

        let (complete, downloaded, pending) = {
            let store = shared.store.lock().unwrap();
            (
                store.is_complete(),
                store.downloaded_size(),
                store.pending_count(),
            )
        };
        let (connecting, peers) = shared.peer_activity();

        if complete {
            pb.finish_with_message("complete");
            println!("\nDownload complete!");
            shared.stop();
            return;
        }

        // Stalled is distinct from complete: every connection attempt has
        // resolved, no session survives, and pieces are still pending
        if peers == 0 && connecting == 0 {
            pb.abandon_with_message("stalled");
            warn!("download stalled: no peers remaining, {} pieces pending", pending);
            println!("\nDownload stalled: no peers remaining.");
            shared.stop();
            return;
        }

        pb.set_position(downloaded);
        pb.set_message(format!("{} peers | {} pieces pending", peers, pending));

        thread::sleep(MONITOR_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Instant;

    use tempfile::TempDir;

    use super::*;
    use crate::torrent::FileEntry;

    fn offline_torrent() -> Torrent {
        Torrent::from_parts(
            16384,
            vec![vec![0; 20]],
            vec![FileEntry {
                path: PathBuf::from("data.bin"),
                length: 100,
            }],
        )
    }

    #[test]
    fn peer_id_has_client_prefix_and_twenty_bytes() {
        let peer_id = generate_peer_id();
        assert_eq!(peer_id.len(), 20);
        assert_eq!(&peer_id[..8], PEER_ID_PREFIX);
        assert!(peer_id[8..].iter().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn no_peers_is_reported_as_stalled_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut downloader = Downloader::new(offline_torrent(), dir.path()).unwrap();

        // No announce tiers, so discovery yields zero peers and the
        // monitor must stop the download instead of polling forever
        downloader.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while downloader.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }

        assert!(!downloader.is_running());
        assert!(!downloader.is_complete());
        downloader.join();
    }

    #[test]
    fn activity_snapshot_never_misses_a_registering_peer() {
        let dir = TempDir::new().unwrap();
        let downloader = Downloader::new(offline_torrent(), dir.path()).unwrap();
        let shared = Arc::clone(&downloader.shared);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let peer = Peer::new(std::net::Ipv4Addr::LOCALHOST, 6881);

        for _ in 0..100 {
            shared.active.lock().unwrap().clear();
            shared.control.lock().unwrap().connecting = 1;

            let writer = Arc::clone(&shared);
            let handle = stream.try_clone().unwrap();
            let worker = thread::spawn(move || {
                // Same order as run_peer: register, then resolve the attempt
                writer.active.lock().unwrap().push((peer, handle));
                writer.connect_finished();
            });

            // From any snapshot, a peer mid-registration must show up as
            // either an in-flight attempt or a registered session; a
            // (0, 0) reading here would be misreported as a stall
            loop {
                let (connecting, peers) = shared.peer_activity();
                assert!(connecting > 0 || peers > 0, "live session invisible");
                if connecting == 0 {
                    break;
                }
            }

            worker.join().unwrap();
            assert_eq!(shared.peer_activity(), (0, 1));
        }
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let downloader = Downloader::new(offline_torrent(), dir.path()).unwrap();

        assert!(downloader.is_running());
        downloader.stop();
        assert!(!downloader.is_running());
        downloader.stop();
        assert!(!downloader.is_running());

        let handle = downloader.shutdown_handle();
        handle.stop();
        assert!(!downloader.is_running());
    }
}
