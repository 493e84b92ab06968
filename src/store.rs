//! Global download progress: the piece store.
//!
//! The store owns every piece's block state, the pending-piece pool, the
//! verified bitfield and the progress counters, and it performs hash
//! verification and disk assembly. Workers share one store behind a mutex;
//! every operation here assumes the caller holds that lock, so all reads
//! feeding a scheduling decision are consistent with the mutations they
//! race against.
//!
//! Piece selection is first-fit over a pool shuffled once at startup.
//! Pieces that fail verification are reinserted at the front of the pool
//! so they are retried before untouched pieces.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::bitfield::Bitfield;
use crate::error::{Error, Result};
use crate::piece::Piece;
use crate::torrent::{FileEntry, Torrent};

/// Shared piece/block table and disk assembly engine.
pub struct PieceStore {
    /// Every piece of the torrent, indexed by piece index
    pieces: Vec<Piece>,
    /// Unassigned piece indices in a fixed randomized order
    pending: VecDeque<u32>,
    /// Bit per piece, set iff verified
    bitfield: Bitfield,
    verified_count: usize,
    /// Sum of the lengths of all verified pieces
    downloaded_size: u64,
    files: Vec<FileEntry>,
    piece_length: u64,
    download_dir: PathBuf,
}

impl PieceStore {
    /// Builds the store and pre-sizes every declared output file.
    pub fn new(torrent: &Torrent, download_dir: &Path) -> Result<PieceStore> {
        PieceStore::build(torrent, download_dir, &mut rand::thread_rng())
    }

    /// Builds the store with a fixed shuffle seed, for deterministic tests.
    #[cfg(test)]
    pub(crate) fn with_seed(torrent: &Torrent, download_dir: &Path, seed: u64) -> Result<PieceStore> {
        use rand::{rngs::StdRng, SeedableRng};
        PieceStore::build(torrent, download_dir, &mut StdRng::seed_from_u64(seed))
    }

    fn build(torrent: &Torrent, download_dir: &Path, rng: &mut impl Rng) -> Result<PieceStore> {
        let pieces: Vec<Piece> = (0..torrent.piece_count())
            .map(|i| {
                Piece::new(
                    i as u32,
                    torrent.piece_length_at(i) as u32,
                    torrent.piece_hashes()[i].clone(),
                )
            })
            .collect();

        let mut pending: Vec<u32> = (0..pieces.len() as u32).collect();
        pending.shuffle(rng);

        let store = PieceStore {
            bitfield: Bitfield::new(pieces.len()),
            pieces,
            pending: VecDeque::from(pending),
            verified_count: 0,
            downloaded_size: 0,
            files: torrent.files().to_vec(),
            piece_length: torrent.piece_length(),
            download_dir: download_dir.to_path_buf(),
        };
        store.init_files()?;

        Ok(store)
    }

    /// Creates or truncates every output file to its final length, so
    /// verified pieces can be written in place in any order.
    fn init_files(&self) -> Result<()> {
        for entry in &self.files {
            let path = self.download_dir.join(&entry.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::Disk {
                    path: path.clone(),
                    source: e,
                })?;
            }

            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| Error::Disk {
                    path: path.clone(),
                    source: e,
                })?;
            file.set_len(entry.length).map_err(|e| Error::Disk {
                path: path.clone(),
                source: e,
            })?;
        }

        Ok(())
    }

    /// Claims the first pending piece the remote peer can serve.
    ///
    /// First-fit over the startup shuffle order. The returned piece is
    /// marked assigned and removed from the pool; the caller owns it until
    /// it verifies or fails verification.
    pub fn select_piece_for_peer(&mut self, remote: &Bitfield) -> Option<u32> {
        let position = self.pending.iter().position(|&index| {
            let piece = &self.pieces[index as usize];
            !piece.assigned && remote.has(index as usize)
        })?;

        let index = self.pending.remove(position)?;
        self.pieces[index as usize].assigned = true;

        Some(index)
    }

    /// Returns the next block of `index` to request, marking it requested.
    pub fn next_block_to_request(&mut self, index: u32) -> Option<(u32, u32)> {
        self.pieces.get_mut(index as usize)?.next_needed_block()
    }

    /// Stores a received block and drives verification and disk writes.
    ///
    /// Blocks for already-verified pieces are ignored. When the last block
    /// of a piece lands, the piece is hashed: a match commits it to disk
    /// and the global accounting; a mismatch resets the piece and requeues
    /// it ahead of all other pending pieces.
    pub fn receive_block(&mut self, index: u32, offset: u32, data: &[u8]) -> Result<()> {
        if index as usize >= self.pieces.len() {
            return Err(Error::Protocol("piece index out of range"));
        }

        {
            let piece = &mut self.pieces[index as usize];
            if piece.verified {
                return Ok(());
            }
            if offset as u64 + data.len() as u64 > piece.length as u64 {
                return Err(Error::Protocol("block exceeds piece bounds"));
            }

            piece.store_block(offset, data);
            if !piece.all_blocks_downloaded() {
                return Ok(());
            }
        }

        if self.pieces[index as usize].hash_matches() {
            self.commit_piece(index)
        } else {
            warn!("piece {} failed hash check, requeueing", index);
            self.pieces[index as usize].reset();
            self.pending.push_front(index);
            Ok(())
        }
    }

    /// Writes a verified piece to disk and updates the global accounting.
    fn commit_piece(&mut self, index: u32) -> Result<()> {
        let piece = &self.pieces[index as usize];
        let Some(data) = piece.data.as_deref() else {
            return Err(Error::Protocol("verified piece has no buffer"));
        };
        let piece_length = piece.length as u64;

        let piece_offset = index as u64 * self.piece_length;
        write_piece_to_files(&self.download_dir, &self.files, piece_offset, data)?;

        let piece = &mut self.pieces[index as usize];
        piece.data = None;
        piece.verified = true;
        self.bitfield.set(index as usize);
        self.verified_count += 1;
        self.downloaded_size += piece_length;

        info!(
            "piece {} verified and written ({}/{})",
            index,
            self.verified_count,
            self.pieces.len()
        );

        Ok(())
    }

    /// Returns an assigned but unverified piece to the front of the pool.
    ///
    /// Called when a worker exits while holding a claim, so the piece is
    /// not stranded on a dead connection.
    pub fn release_piece(&mut self, index: u32) {
        let Some(piece) = self.pieces.get_mut(index as usize) else {
            return;
        };
        if piece.verified || !piece.assigned {
            return;
        }

        piece.reset();
        self.pending.push_front(index);
    }

    pub fn is_complete(&self) -> bool {
        self.verified_count == self.pieces.len()
    }

    pub fn is_verified(&self, index: u32) -> bool {
        self.pieces
            .get(index as usize)
            .is_some_and(|p| p.verified)
    }

    pub fn is_assigned(&self, index: u32) -> bool {
        self.pieces
            .get(index as usize)
            .is_some_and(|p| p.assigned)
    }

    pub fn downloaded_size(&self) -> u64 {
        self.downloaded_size
    }

    pub fn verified_count(&self) -> usize {
        self.verified_count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }
}

/// Writes a piece's bytes across every output file its range overlaps.
///
/// The file set forms one contiguous logical stream; for each overlapping
/// file the sub-range is computed relative to both the piece buffer and
/// the file, and written at the file offset. Files were pre-sized at
/// startup, so every write lands in bounds.
fn write_piece_to_files(
    download_dir: &Path,
    files: &[FileEntry],
    piece_offset: u64,
    data: &[u8],
) -> Result<()> {
    let piece_end = piece_offset + data.len() as u64;
    let mut file_start: u64 = 0;

    for entry in files {
        let file_end = file_start + entry.length;

        if piece_offset < file_end && piece_end > file_start {
            let write_start = piece_offset.max(file_start);
            let write_end = piece_end.min(file_end);
            let slice = &data[(write_start - piece_offset) as usize..(write_end - piece_offset) as usize];

            let path = download_dir.join(&entry.path);
            let mut file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| Error::Disk {
                    path: path.clone(),
                    source: e,
                })?;
            file.seek(SeekFrom::Start(write_start - file_start))
                .map_err(|e| Error::Disk {
                    path: path.clone(),
                    source: e,
                })?;
            file.write_all(slice).map_err(|e| Error::Disk {
                path: path.clone(),
                source: e,
            })?;
        }

        file_start = file_end;
    }

    Ok(())
}
