//! BitTorrent handshake frame.
//!
//! The handshake is the fixed 68-byte exchange that opens every peer
//! connection:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - pstrlen: 1 byte, always 19
//! - pstr: the literal protocol name "BitTorrent protocol"
//! - reserved: 8 zero bytes
//! - info_hash: 20 bytes identifying the torrent
//! - peer_id: 20 bytes identifying the peer
//!
//! A session becomes active only after the remote handshake has been read
//! in full and its info hash matches ours.

use crate::error::{Error, Result};

const PROTOCOL_ID: &str = "BitTorrent protocol";

/// Total size of a handshake frame on the wire.
pub const HANDSHAKE_LEN: usize = 68;

/// A decoded handshake frame.
pub struct Handshake {
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: Vec<u8>,
    /// 20-byte unique identifier of the sending peer
    pub peer_id: Vec<u8>,
}

impl Handshake {
    /// Builds a handshake for the given torrent and local peer id.
    pub fn new(info_hash: Vec<u8>, peer_id: Vec<u8>) -> Handshake {
        Handshake { info_hash, peer_id }
    }

    /// Serializes the handshake into its fixed 68-byte wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut serialized: Vec<u8> = Vec::with_capacity(HANDSHAKE_LEN);

        serialized.push(PROTOCOL_ID.len() as u8);
        serialized.extend_from_slice(PROTOCOL_ID.as_bytes());
        serialized.extend_from_slice(&[0; 8]);
        serialized.extend_from_slice(&self.info_hash);
        serialized.extend_from_slice(&self.peer_id);

        serialized
    }

    /// Parses a received 68-byte handshake frame.
    ///
    /// Fails if the protocol-name length byte does not announce the
    /// standard protocol. The info-hash comparison is left to the caller,
    /// which knows the expected hash.
    pub fn parse(buf: &[u8; HANDSHAKE_LEN]) -> Result<Handshake> {
        if buf[0] as usize != PROTOCOL_ID.len() {
            return Err(Error::Handshake("invalid protocol identifier"));
        }

        let pstrlen = PROTOCOL_ID.len();
        let info_hash = buf[pstrlen + 9..pstrlen + 29].to_vec();
        let peer_id = buf[pstrlen + 29..].to_vec();

        Ok(Handshake { info_hash, peer_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_handshake_is_68_bytes() {
        let handshake = Handshake::new(vec![1; 20], vec![2; 20]);
        let serialized = handshake.serialize();

        assert_eq!(serialized.len(), HANDSHAKE_LEN);
        assert_eq!(serialized[0], 19);
        assert_eq!(&serialized[1..20], b"BitTorrent protocol");
        assert_eq!(&serialized[20..28], &[0; 8]);
        assert_eq!(&serialized[28..48], &[1; 20][..]);
        assert_eq!(&serialized[48..68], &[2; 20][..]);
    }

    #[test]
    fn parse_round_trips_serialize() {
        let info_hash: Vec<u8> = (0..20).collect();
        let peer_id: Vec<u8> = (20..40).collect();
        let serialized = Handshake::new(info_hash.clone(), peer_id.clone()).serialize();

        let mut buf = [0; HANDSHAKE_LEN];
        buf.copy_from_slice(&serialized);
        let parsed = Handshake::parse(&buf).unwrap();

        assert_eq!(parsed.info_hash, info_hash);
        assert_eq!(parsed.peer_id, peer_id);
    }

    #[test]
    fn parse_rejects_wrong_protocol_length() {
        let mut buf = [0; HANDSHAKE_LEN];
        buf[0] = 18;
        assert!(Handshake::parse(&buf).is_err());
    }
}
