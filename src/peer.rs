//! Peer addresses and the compact peer-list encoding.
//!
//! Trackers most commonly return peers in the compact format: 6 bytes per
//! peer, 4 bytes of IPv4 address followed by a big-endian port.

use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{Error, Result};

const COMPACT_PEER_SIZE: usize = 6;

/// The network address of a candidate peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Peer {
    pub fn new(ip: Ipv4Addr, port: u16) -> Peer {
        Peer { ip, port }
    }

    /// Socket address used to open the TCP connection.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parses a packed 6-byte-per-peer blob into peer addresses.
pub fn parse_compact(bytes: &[u8]) -> Result<Vec<Peer>> {
    if bytes.len() % COMPACT_PEER_SIZE != 0 {
        return Err(Error::Tracker(
            "compact peer list is not a multiple of 6 bytes".to_string(),
        ));
    }

    let mut peers = Vec::with_capacity(bytes.len() / COMPACT_PEER_SIZE);
    for entry in bytes.chunks_exact(COMPACT_PEER_SIZE) {
        let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
        let mut cursor = Cursor::new(&entry[4..6]);
        let port = cursor.read_u16::<BigEndian>()?;
        peers.push(Peer::new(ip, port));
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_compact_decodes_addresses() {
        let bytes = [192, 168, 1, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80];
        let peers = parse_compact(&bytes).unwrap();

        assert_eq!(
            peers,
            vec![
                Peer::new(Ipv4Addr::new(192, 168, 1, 1), 6881),
                Peer::new(Ipv4Addr::new(10, 0, 0, 2), 80),
            ]
        );
    }

    #[test]
    fn parse_compact_rejects_truncated_entries() {
        assert!(parse_compact(&[192, 168, 1, 1, 0x1a]).is_err());
    }

    #[test]
    fn parse_compact_of_empty_blob_is_empty() {
        assert!(parse_compact(&[]).unwrap().is_empty());
    }
}
