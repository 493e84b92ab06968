//! Tracker peer discovery.
//!
//! Turns the torrent's announce tiers into a candidate peer list. Each
//! URL is tried in order; the first announce that yields peers wins. Any
//! per-URL failure (timeout, malformed response, unreachable host) just
//! advances to the next URL, then the next tier; total failure produces
//! an empty list rather than an error.
//!
//! Two wire forms are supported: HTTP GET with bencoded responses, and
//! the binary UDP protocol (connect round-trip, then announce). Both
//! deliver peers in the packed 6-byte compact layout; HTTP trackers may
//! alternatively send a list of explicit ip/port dictionaries.

use std::collections::HashSet;
use std::io::Cursor;
use std::net::{Ipv4Addr, UdpSocket};
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};
use rand::Rng;
use serde::Deserialize;
use serde_bencode::de;
use serde_bencode::value::Value;
use url::Url;

use crate::error::{Error, Result};
use crate::peer::{self, Peer};
use crate::torrent::Torrent;

/// Port reported to trackers as our listening port.
const PORT: u16 = 6881;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const UDP_TIMEOUT: Duration = Duration::from_secs(8);

/// Fixed magic value identifying a UDP tracker connect request.
const UDP_PROTOCOL_ID: u64 = 0x0417_2710_1980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
/// Announce event tag for a download that just started.
const EVENT_STARTED: u32 = 2;

/// Bencoded body of an HTTP tracker response.
#[derive(Deserialize)]
struct BencodeTrackerResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    peers: Option<Value>,
}

/// Announce client for one torrent.
pub struct Tracker {
    tiers: Vec<Vec<String>>,
    info_hash: Vec<u8>,
    peer_id: Vec<u8>,
    /// Bytes left to download, reported to the tracker
    left: u64,
}

impl Tracker {
    pub fn new(torrent: &Torrent, peer_id: Vec<u8>) -> Tracker {
        Tracker {
            tiers: torrent.tiers().to_vec(),
            info_hash: torrent.info_hash().to_vec(),
            peer_id,
            left: torrent.total_size(),
        }
    }

    /// Walks the announce tiers and returns the first non-empty peer
    /// list, deduplicated. Returns an empty list when every URL fails.
    pub fn discover_peers(&self) -> Vec<Peer> {
        for tier in &self.tiers {
            for announce in tier {
                let result = if announce.starts_with("udp") {
                    self.announce_udp(announce)
                } else {
                    self.announce_http(announce)
                };

                match result {
                    Ok(peers) if !peers.is_empty() => {
                        debug!("tracker {} returned {} peers", announce, peers.len());
                        return dedupe(peers);
                    }
                    Ok(_) => debug!("tracker {} returned no peers", announce),
                    Err(e) => warn!("tracker {} failed: {}", announce, e),
                }
            }
        }

        vec![]
    }

    fn announce_http(&self, announce: &str) -> Result<Vec<Peer>> {
        let url = self.build_announce_url(announce)?;

        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Tracker(format!("could not build http client: {e}")))?;

        let response = client
            .get(&url)
            .send()
            .and_then(|r| r.bytes())
            .map_err(|e| Error::Tracker(format!("request failed: {e}")))?;

        let decoded = de::from_bytes::<BencodeTrackerResponse>(&response)
            .map_err(|e| Error::Tracker(format!("could not decode response: {e}")))?;

        if let Some(reason) = decoded.failure_reason {
            return Err(Error::Tracker(reason));
        }
        let peers = decoded
            .peers
            .ok_or_else(|| Error::Tracker("response has no peers".to_string()))?;

        parse_peer_entries(&peers)
    }

    /// Builds the announce URL with the binary info hash and peer id
    /// percent-encoded by hand, since they are raw bytes rather than
    /// UTF-8 text.
    fn build_announce_url(&self, announce: &str) -> Result<String> {
        fn percent_encode_binary(data: &[u8]) -> String {
            const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
            let mut encoded = String::with_capacity(data.len() * 3);
            for &byte in data {
                encoded.push('%');
                encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
                encoded.push(HEX_DIGITS[(byte & 0x0f) as usize] as char);
            }
            encoded
        }

        let base_url = Url::parse(announce)
            .map_err(|_| Error::Tracker(format!("could not parse tracker url {announce}")))?;

        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
            percent_encode_binary(&self.info_hash),
            percent_encode_binary(&self.peer_id),
            PORT,
            self.left,
        );

        let mut url = base_url.to_string();
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(&query);

        Ok(url)
    }

    /// Announces over the binary UDP protocol: a connect round-trip to
    /// obtain a connection id, then the announce proper.
    fn announce_udp(&self, announce: &str) -> Result<Vec<Peer>> {
        let url = Url::parse(announce)
            .map_err(|_| Error::Tracker(format!("could not parse tracker url {announce}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::Tracker("udp tracker url has no host".to_string()))?;
        let port = url
            .port()
            .ok_or_else(|| Error::Tracker("udp tracker url has no port".to_string()))?;

        let socket = UdpSocket::bind("0.0.0.0:0")
            .map_err(|e| Error::Tracker(format!("could not bind udp socket: {e}")))?;
        socket
            .set_read_timeout(Some(UDP_TIMEOUT))
            .and_then(|_| socket.set_write_timeout(Some(UDP_TIMEOUT)))
            .map_err(|e| Error::Tracker(format!("could not set udp timeouts: {e}")))?;
        socket
            .connect((host, port))
            .map_err(|e| Error::Tracker(format!("could not reach udp tracker: {e}")))?;

        let mut rng = rand::thread_rng();
        let mut buf = [0; 2048];

        // Round trip 1: obtain a connection id
        let transaction_id: u32 = rng.gen();
        socket
            .send(&build_connect_request(transaction_id)?)
            .map_err(|e| Error::Tracker(format!("udp send failed: {e}")))?;
        let n = socket
            .recv(&mut buf)
            .map_err(|e| Error::Tracker(format!("udp recv failed: {e}")))?;
        if n < 16 {
            return Err(Error::Tracker("udp connect response too short".to_string()));
        }

        let mut cursor = Cursor::new(&buf[..16]);
        let action = cursor.read_u32::<BigEndian>()?;
        let echoed = cursor.read_u32::<BigEndian>()?;
        let connection_id = cursor.read_u64::<BigEndian>()?;
        if action != ACTION_CONNECT || echoed != transaction_id {
            return Err(Error::Tracker("udp tracker connection failed".to_string()));
        }

        // Round trip 2: announce
        let transaction_id: u32 = rng.gen();
        let request = build_announce_request(
            connection_id,
            transaction_id,
            &self.info_hash,
            &self.peer_id,
            self.left,
            rng.gen(),
        )?;
        socket
            .send(&request)
            .map_err(|e| Error::Tracker(format!("udp send failed: {e}")))?;
        let n = socket
            .recv(&mut buf)
            .map_err(|e| Error::Tracker(format!("udp recv failed: {e}")))?;
        if n < 20 {
            return Err(Error::Tracker("udp announce response too short".to_string()));
        }

        let mut cursor = Cursor::new(&buf[..8]);
        let action = cursor.read_u32::<BigEndian>()?;
        let echoed = cursor.read_u32::<BigEndian>()?;
        if action != ACTION_ANNOUNCE || echoed != transaction_id {
            return Err(Error::Tracker("udp tracker announce failed".to_string()));
        }

        // Bytes after the 20-byte header are compact peer entries
        peer::parse_compact(&buf[20..n])
    }
}

fn build_connect_request(transaction_id: u32) -> Result<Vec<u8>> {
    let mut packet = vec![];
    packet.write_u64::<BigEndian>(UDP_PROTOCOL_ID)?;
    packet.write_u32::<BigEndian>(ACTION_CONNECT)?;
    packet.write_u32::<BigEndian>(transaction_id)?;
    Ok(packet)
}

fn build_announce_request(
    connection_id: u64,
    transaction_id: u32,
    info_hash: &[u8],
    peer_id: &[u8],
    left: u64,
    key: u32,
) -> Result<Vec<u8>> {
    let mut packet = vec![];
    packet.write_u64::<BigEndian>(connection_id)?;
    packet.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
    packet.write_u32::<BigEndian>(transaction_id)?;
    packet.extend_from_slice(info_hash);
    packet.extend_from_slice(peer_id);
    packet.write_u64::<BigEndian>(0)?; // downloaded
    packet.write_u64::<BigEndian>(left)?;
    packet.write_u64::<BigEndian>(0)?; // uploaded
    packet.write_u32::<BigEndian>(EVENT_STARTED)?;
    packet.write_u32::<BigEndian>(0)?; // ip: let the tracker use the source
    packet.write_u32::<BigEndian>(key)?;
    packet.write_i32::<BigEndian>(-1)?; // num_want: tracker default
    packet.write_u16::<BigEndian>(PORT)?;
    Ok(packet)
}

/// Decodes the `peers` field of an HTTP tracker response, which is either
/// a packed compact blob or a list of explicit ip/port dictionaries.
fn parse_peer_entries(value: &Value) -> Result<Vec<Peer>> {
    match value {
        Value::Bytes(bytes) => peer::parse_compact(bytes),
        Value::List(entries) => {
            let mut peers = Vec::with_capacity(entries.len());
            for entry in entries {
                let Value::Dict(dict) = entry else {
                    return Err(Error::Tracker("malformed peer entry".to_string()));
                };

                let ip = match dict.get(b"ip".as_slice()) {
                    Some(Value::Bytes(bytes)) => std::str::from_utf8(bytes)
                        .ok()
                        .and_then(|s| s.parse::<Ipv4Addr>().ok())
                        .ok_or_else(|| Error::Tracker("malformed peer ip".to_string()))?,
                    _ => return Err(Error::Tracker("peer entry has no ip".to_string())),
                };
                let port = match dict.get(b"port".as_slice()) {
                    Some(Value::Int(port)) => u16::try_from(*port)
                        .map_err(|_| Error::Tracker("peer port out of range".to_string()))?,
                    _ => return Err(Error::Tracker("peer entry has no port".to_string())),
                };

                peers.push(Peer::new(ip, port));
            }
            Ok(peers)
        }
        _ => Err(Error::Tracker("malformed peers field".to_string())),
    }
}

fn dedupe(peers: Vec<Peer>) -> Vec<Peer> {
    let mut seen = HashSet::new();
    peers.into_iter().filter(|p| seen.insert(*p)).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn compact_and_dictionary_forms_decode_identically() {
        let compact = Value::Bytes(vec![192, 168, 1, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80]);

        let dict_entry = |ip: &str, port: i64| {
            let mut dict = HashMap::new();
            dict.insert(b"ip".to_vec(), Value::Bytes(ip.as_bytes().to_vec()));
            dict.insert(b"port".to_vec(), Value::Int(port));
            Value::Dict(dict)
        };
        let dictionaries = Value::List(vec![
            dict_entry("192.168.1.1", 6881),
            dict_entry("10.0.0.2", 80),
        ]);

        assert_eq!(
            parse_peer_entries(&compact).unwrap(),
            parse_peer_entries(&dictionaries).unwrap()
        );
    }

    #[test]
    fn malformed_peer_entries_are_rejected() {
        assert!(parse_peer_entries(&Value::Int(1)).is_err());
        assert!(parse_peer_entries(&Value::List(vec![Value::Int(1)])).is_err());

        let mut no_port = HashMap::new();
        no_port.insert(b"ip".to_vec(), Value::Bytes(b"10.0.0.1".to_vec()));
        assert!(parse_peer_entries(&Value::List(vec![Value::Dict(no_port)])).is_err());
    }

    #[test]
    fn announce_url_percent_encodes_binary_fields() {
        let tracker = Tracker {
            tiers: vec![],
            info_hash: vec![0xff; 20],
            peer_id: b"-RM0001-abcdefghijkl".to_vec(),
            left: 20000,
        };

        let url = tracker
            .build_announce_url("http://tracker.example/announce")
            .unwrap();

        assert!(url.starts_with("http://tracker.example/announce?info_hash="));
        assert!(url.contains(&"%FF".repeat(20)));
        assert!(url.contains("left=20000"));
        assert!(url.contains("compact=1"));
        assert!(url.contains("event=started"));
    }

    #[test]
    fn connect_request_layout() {
        let packet = build_connect_request(0xdead_beef).unwrap();

        assert_eq!(packet.len(), 16);
        assert_eq!(&packet[0..8], &[0, 0, 0x04, 0x17, 0x27, 0x10, 0x19, 0x80]);
        assert_eq!(&packet[8..12], &[0, 0, 0, 0]);
        assert_eq!(&packet[12..16], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn announce_request_layout() {
        let packet = build_announce_request(
            0x0102_0304_0506_0708,
            0xcafe_babe,
            &[0xaa; 20],
            &[0xbb; 20],
            20000,
            7,
        )
        .unwrap();

        assert_eq!(packet.len(), 98);
        assert_eq!(&packet[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&packet[8..12], &[0, 0, 0, 1]); // action: announce
        assert_eq!(&packet[12..16], &[0xca, 0xfe, 0xba, 0xbe]);
        assert_eq!(&packet[16..36], &[0xaa; 20][..]);
        assert_eq!(&packet[36..56], &[0xbb; 20][..]);
        assert_eq!(&packet[56..64], &[0; 8][..]); // downloaded
        assert_eq!(&packet[64..72], &20000u64.to_be_bytes()[..]); // left
        assert_eq!(&packet[80..84], &[0, 0, 0, 2]); // event: started
        assert_eq!(&packet[92..96], &[0xff; 4][..]); // num_want: -1
        assert_eq!(&packet[96..98], &PORT.to_be_bytes()[..]);
    }

    #[test]
    fn dedupe_preserves_first_occurrence_order() {
        let a = Peer::new(Ipv4Addr::new(1, 1, 1, 1), 1);
        let b = Peer::new(Ipv4Addr::new(2, 2, 2, 2), 2);

        assert_eq!(dedupe(vec![a, b, a, b, a]), vec![a, b]);
    }
}
