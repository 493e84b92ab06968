//! Per-piece download state.
//!
//! A piece is the unit of verification: it carries an expected SHA-1 hash
//! and is split into 16 KiB blocks, the unit of transfer. Blocks may
//! arrive in any order; each carries an explicit offset. Once every block
//! is downloaded the assembled buffer is hashed, and on a mismatch the
//! whole piece resets so it can be fetched again.

use sha1::{Digest, Sha1};

/// Standard block size for piece transfers (16 KiB).
pub const BLOCK_SIZE: u32 = 16384;

/// Transfer state of a single block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Needed,
    Requested,
    Downloaded,
}

/// A sub-range of a piece, requested and transferred individually.
#[derive(Debug, Clone)]
pub struct Block {
    /// Byte offset within the piece
    pub offset: u32,
    /// Block length (BLOCK_SIZE, except a truncated final block)
    pub length: u32,
    pub status: BlockStatus,
}

/// Download state of a single piece.
#[derive(Debug, Clone)]
pub struct Piece {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Piece length in bytes (shorter for a trailing final piece)
    pub length: u32,
    /// Expected 20-byte SHA-1 hash
    pub hash: Vec<u8>,
    /// Blocks covering the piece, in offset order
    pub blocks: Vec<Block>,
    /// Assembly buffer, allocated on first block, dropped after write
    pub data: Option<Vec<u8>>,
    /// Claimed by some peer session
    pub assigned: bool,
    /// Hash-checked and written to disk; terminal
    pub verified: bool,
}

impl Piece {
    pub fn new(index: u32, length: u32, hash: Vec<u8>) -> Piece {
        Piece {
            index,
            length,
            hash,
            blocks: init_blocks(length),
            data: None,
            assigned: false,
            verified: false,
        }
    }

    /// Returns the first block still needed and marks it requested.
    pub fn next_needed_block(&mut self) -> Option<(u32, u32)> {
        let block = self
            .blocks
            .iter_mut()
            .find(|b| b.status == BlockStatus::Needed)?;
        block.status = BlockStatus::Requested;
        Some((block.offset, block.length))
    }

    /// Copies a received block into the assembly buffer.
    ///
    /// The buffer is allocated lazily on the first block. The block whose
    /// offset matches exactly is marked downloaded; the byte count written
    /// is whatever the peer sent.
    pub fn store_block(&mut self, offset: u32, data: &[u8]) {
        let piece_length = self.length as usize;
        let buffer = self.data.get_or_insert_with(|| vec![0; piece_length]);
        buffer[offset as usize..offset as usize + data.len()].copy_from_slice(data);

        if let Some(block) = self.blocks.iter_mut().find(|b| b.offset == offset) {
            block.status = BlockStatus::Downloaded;
        }
    }

    pub fn all_blocks_downloaded(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| b.status == BlockStatus::Downloaded)
    }

    /// Hashes the assembled buffer and compares it to the expected hash.
    pub fn hash_matches(&self) -> bool {
        let Some(data) = &self.data else {
            return false;
        };

        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().as_slice() == self.hash
    }

    /// Discards downloaded data and returns every block to needed.
    pub fn reset(&mut self) {
        self.data = None;
        self.assigned = false;
        self.blocks = init_blocks(self.length);
    }
}

/// Splits a piece into contiguous blocks covering exactly its length.
fn init_blocks(piece_length: u32) -> Vec<Block> {
    let nb_blocks = piece_length.div_ceil(BLOCK_SIZE);
    (0..nb_blocks)
        .map(|i| {
            let offset = i * BLOCK_SIZE;
            Block {
                offset,
                length: BLOCK_SIZE.min(piece_length - offset),
                status: BlockStatus::Needed,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha1_of(data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().to_vec()
    }

    #[test]
    fn blocks_cover_piece_exactly() {
        let piece = Piece::new(0, 40000, vec![0; 20]);
        assert_eq!(piece.blocks.len(), 3);
        assert_eq!(
            piece
                .blocks
                .iter()
                .map(|b| (b.offset, b.length))
                .collect::<Vec<_>>(),
            vec![(0, 16384), (16384, 16384), (32768, 7232)]
        );
    }

    #[test]
    fn short_piece_is_one_truncated_block() {
        let piece = Piece::new(1, 3616, vec![0; 20]);
        assert_eq!(piece.blocks.len(), 1);
        assert_eq!(piece.blocks[0].length, 3616);
    }

    #[test]
    fn next_needed_block_walks_in_order_then_exhausts() {
        let mut piece = Piece::new(0, 32768, vec![0; 20]);
        assert_eq!(piece.next_needed_block(), Some((0, 16384)));
        assert_eq!(piece.next_needed_block(), Some((16384, 16384)));
        assert_eq!(piece.next_needed_block(), None);
    }

    #[test]
    fn out_of_order_blocks_assemble_correctly() {
        let first: Vec<u8> = vec![0x11; 16384];
        let second: Vec<u8> = vec![0x22; 4096];
        let mut whole = first.clone();
        whole.extend_from_slice(&second);

        let mut piece = Piece::new(0, 20480, sha1_of(&whole));

        // Deliver the tail before the head
        piece.store_block(16384, &second);
        assert!(!piece.all_blocks_downloaded());
        piece.store_block(0, &first);

        assert!(piece.all_blocks_downloaded());
        assert!(piece.hash_matches());
        assert_eq!(piece.data.as_deref(), Some(&whole[..]));
    }

    #[test]
    fn hash_mismatch_detected_and_reset_clears_state() {
        let mut piece = Piece::new(0, 100, sha1_of(b"expected content"));
        piece.assigned = true;
        piece.store_block(0, &[0; 100]);

        assert!(piece.all_blocks_downloaded());
        assert!(!piece.hash_matches());

        piece.reset();
        assert!(piece.data.is_none());
        assert!(!piece.assigned);
        assert!(piece
            .blocks
            .iter()
            .all(|b| b.status == BlockStatus::Needed));
    }
}
