//! Torrent metadata loading.
//!
//! Parses the bencoded .torrent container into an immutable descriptor:
//! the info hash, the per-piece SHA-1 hashes, the piece length and the
//! declared output files. Both single-file torrents (`name` + `length`)
//! and multi-file torrents (`files` list) are supported; either way the
//! file set is treated downstream as one contiguous byte stream.
//!
//! The info hash is the SHA-1 digest of the canonical bencoding of the
//! `info` dictionary. It is computed from the untyped decoded value, not
//! the typed struct, so keys the descriptor does not model still count
//! toward the digest.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

const SHA1_HASH_SIZE: usize = 20;

/// One declared output file: a path relative to the download directory
/// and its final length in bytes.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

/// Immutable torrent descriptor built from a .torrent file.
#[derive(Debug, Clone)]
pub struct Torrent {
    /// Tracker tiers (each tier is an ordered list of announce URLs)
    tiers: Vec<Vec<String>>,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    info_hash: Vec<u8>,
    /// One 20-byte SHA-1 hash per piece
    piece_hashes: Vec<Vec<u8>>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u64,
    /// Declared output files, in stream order
    files: Vec<FileEntry>,
    /// Sum of all file lengths
    total_size: u64,
    /// Suggested name from the metadata
    name: String,
}

#[derive(Deserialize, Serialize)]
struct BencodeFile {
    path: Vec<String>,
    length: u64,
}

#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Concatenation of all pieces' 20-byte SHA-1 hashes
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u64,
    name: String,
    // Single-file form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    // Multi-file form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    files: Option<Vec<BencodeFile>>,
}

#[derive(Deserialize, Serialize)]
struct BencodeTorrent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    announce: Option<String>,
    #[serde(rename = "announce-list", default, skip_serializing_if = "Option::is_none")]
    announce_list: Option<Vec<Vec<String>>>,
    info: BencodeInfo,
}

/// Hashes the canonical bencoding of the `info` dictionary.
///
/// The document is decoded untyped and the `info` entry re-encoded as is,
/// so optional keys absent from `BencodeInfo` (`private`, `source`,
/// per-file checksums, ...) remain part of the digest. Dropping them
/// would produce a hash no tracker or peer recognizes.
fn hash_info_dict(buf: &[u8]) -> Result<Vec<u8>> {
    let document = de::from_bytes::<Value>(buf)
        .map_err(|e| Error::Metainfo(format!("could not decode torrent file: {e}")))?;
    let Value::Dict(mut entries) = document else {
        return Err(Error::Metainfo(
            "torrent file is not a dictionary".to_string(),
        ));
    };
    let info = entries
        .remove(b"info".as_slice())
        .ok_or_else(|| Error::Metainfo("torrent has no info dictionary".to_string()))?;

    let encoded = ser::to_bytes(&info)
        .map_err(|e| Error::Metainfo(format!("could not re-encode info dictionary: {e}")))?;

    let mut hasher = Sha1::new();
    hasher.update(&encoded);

    Ok(hasher.finalize().to_vec())
}

impl BencodeInfo {
    /// Splits the concatenated pieces blob into per-piece hashes.
    fn split_piece_hashes(&self) -> Result<Vec<Vec<u8>>> {
        if self.pieces.len() % SHA1_HASH_SIZE != 0 {
            return Err(Error::Metainfo(
                "pieces blob is not a multiple of 20 bytes".to_string(),
            ));
        }

        Ok(self
            .pieces
            .chunks_exact(SHA1_HASH_SIZE)
            .map(|chunk| chunk.to_vec())
            .collect())
    }
}

impl Torrent {
    /// Loads and validates a .torrent file.
    pub fn open(filepath: &Path) -> Result<Torrent> {
        let mut file = File::open(filepath)
            .map_err(|e| Error::Metainfo(format!("could not open torrent file: {e}")))?;

        let mut buf = vec![];
        file.read_to_end(&mut buf)
            .map_err(|e| Error::Metainfo(format!("could not read torrent file: {e}")))?;

        let bencode = de::from_bytes::<BencodeTorrent>(&buf)
            .map_err(|e| Error::Metainfo(format!("could not decode torrent file: {e}")))?;

        let tiers = match (&bencode.announce_list, &bencode.announce) {
            (Some(list), _) if !list.is_empty() => list.clone(),
            (_, Some(announce)) => vec![vec![announce.clone()]],
            _ => {
                return Err(Error::Metainfo(
                    "torrent has no announce or announce-list".to_string(),
                ))
            }
        };

        let files = match (&bencode.info.files, bencode.info.length) {
            (Some(list), _) => list
                .iter()
                .map(|f| FileEntry {
                    path: f.path.iter().collect(),
                    length: f.length,
                })
                .collect(),
            (None, Some(length)) => vec![FileEntry {
                path: PathBuf::from(&bencode.info.name),
                length,
            }],
            (None, None) => {
                return Err(Error::Metainfo(
                    "torrent has neither length nor files".to_string(),
                ))
            }
        };

        let torrent = Torrent {
            tiers,
            info_hash: hash_info_dict(&buf)?,
            piece_hashes: bencode.info.split_piece_hashes()?,
            piece_length: bencode.info.piece_length,
            total_size: files.iter().map(|f| f.length).sum(),
            files,
            name: bencode.info.name.clone(),
        };
        torrent.validate()?;

        Ok(torrent)
    }

    fn validate(&self) -> Result<()> {
        if self.piece_length == 0 {
            return Err(Error::Metainfo("piece length is zero".to_string()));
        }

        let expected_pieces = self.total_size.div_ceil(self.piece_length);
        if expected_pieces != self.piece_hashes.len() as u64 {
            return Err(Error::Metainfo(format!(
                "torrent declares {} piece hashes but total size requires {}",
                self.piece_hashes.len(),
                expected_pieces
            )));
        }

        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info_hash(&self) -> &[u8] {
        &self.info_hash
    }

    pub fn tiers(&self) -> &[Vec<String>] {
        &self.tiers
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn piece_hashes(&self) -> &[Vec<u8>] {
        &self.piece_hashes
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Length of the piece at `index`.
    ///
    /// Every piece spans the configured piece length except the last,
    /// whose length is the remainder of the total size, defaulting to a
    /// full piece when the sizes divide exactly.
    pub fn piece_length_at(&self, index: usize) -> u64 {
        if index + 1 < self.piece_count() {
            return self.piece_length;
        }

        let remainder = self.total_size % self.piece_length;
        if remainder == 0 {
            self.piece_length
        } else {
            remainder
        }
    }
}

#[cfg(test)]
impl Torrent {
    /// Builds a descriptor directly, bypassing the bencode container.
    pub(crate) fn from_parts(
        piece_length: u64,
        piece_hashes: Vec<Vec<u8>>,
        files: Vec<FileEntry>,
    ) -> Torrent {
        let total_size = files.iter().map(|f| f.length).sum();
        Torrent {
            tiers: vec![],
            info_hash: vec![0; 20],
            piece_hashes,
            piece_length,
            files,
            total_size,
            name: "test".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_torrent(info: BencodeInfo) -> tempfile::NamedTempFile {
        let bencode = BencodeTorrent {
            announce: Some("http://tracker.example/announce".to_string()),
            announce_list: None,
            info,
        };
        let bytes = ser::to_bytes(&bencode).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file
    }

    #[test]
    fn single_file_torrent_with_short_last_piece() {
        // 20000 bytes at 16384 per piece: two pieces, the last 3616 bytes
        let file = write_torrent(BencodeInfo {
            pieces: ByteBuf::from(vec![0xab; 40]),
            piece_length: 16384,
            name: "data.bin".to_string(),
            length: Some(20000),
            files: None,
        });

        let torrent = Torrent::open(file.path()).unwrap();
        assert_eq!(torrent.piece_count(), 2);
        assert_eq!(torrent.total_size(), 20000);
        assert_eq!(torrent.piece_length_at(0), 16384);
        assert_eq!(torrent.piece_length_at(1), 3616);
        assert_eq!(torrent.files().len(), 1);
        assert_eq!(torrent.files()[0].path, PathBuf::from("data.bin"));
        assert_eq!(torrent.info_hash().len(), 20);
    }

    #[test]
    fn info_hash_covers_keys_outside_the_descriptor() {
        use std::collections::HashMap;

        let mut info = HashMap::new();
        info.insert(b"name".to_vec(), Value::Bytes(b"data.bin".to_vec()));
        info.insert(b"piece length".to_vec(), Value::Int(16384));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0xab; 20]));
        info.insert(b"length".to_vec(), Value::Int(100));
        // Not a field of BencodeInfo; must still count toward the hash
        info.insert(b"private".to_vec(), Value::Int(1));
        let info = Value::Dict(info);

        let mut expected = Sha1::new();
        expected.update(ser::to_bytes(&info).unwrap());

        let mut document = HashMap::new();
        document.insert(
            b"announce".to_vec(),
            Value::Bytes(b"http://tracker.example/announce".to_vec()),
        );
        document.insert(b"info".to_vec(), info);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&ser::to_bytes(&Value::Dict(document)).unwrap())
            .unwrap();

        let torrent = Torrent::open(file.path()).unwrap();
        assert_eq!(torrent.info_hash(), expected.finalize().as_slice());
    }

    #[test]
    fn exactly_divisible_last_piece_is_full_length() {
        let file = write_torrent(BencodeInfo {
            pieces: ByteBuf::from(vec![0xab; 40]),
            piece_length: 16384,
            name: "data.bin".to_string(),
            length: Some(32768),
            files: None,
        });

        let torrent = Torrent::open(file.path()).unwrap();
        assert_eq!(torrent.piece_length_at(1), 16384);
    }

    #[test]
    fn multi_file_torrent_sums_lengths_and_joins_paths() {
        let file = write_torrent(BencodeInfo {
            pieces: ByteBuf::from(vec![0xab; 20]),
            piece_length: 16384,
            name: "album".to_string(),
            length: None,
            files: Some(vec![
                BencodeFile {
                    path: vec!["disc1".to_string(), "track1.flac".to_string()],
                    length: 10000,
                },
                BencodeFile {
                    path: vec!["cover.jpg".to_string()],
                    length: 2000,
                },
            ]),
        });

        let torrent = Torrent::open(file.path()).unwrap();
        assert_eq!(torrent.total_size(), 12000);
        assert_eq!(torrent.piece_count(), 1);
        assert_eq!(torrent.files()[0].path, PathBuf::from("disc1/track1.flac"));
        assert_eq!(torrent.files()[1].path, PathBuf::from("cover.jpg"));
    }

    #[test]
    fn piece_hash_count_must_match_total_size() {
        // One hash declared, but 20000 bytes need two pieces
        let file = write_torrent(BencodeInfo {
            pieces: ByteBuf::from(vec![0xab; 20]),
            piece_length: 16384,
            name: "data.bin".to_string(),
            length: Some(20000),
            files: None,
        });

        assert!(Torrent::open(file.path()).is_err());
    }

    #[test]
    fn missing_announce_is_rejected() {
        let bencode = BencodeTorrent {
            announce: None,
            announce_list: None,
            info: BencodeInfo {
                pieces: ByteBuf::from(vec![0xab; 20]),
                piece_length: 16384,
                name: "data.bin".to_string(),
                length: Some(100),
                files: None,
            },
        };
        let bytes = ser::to_bytes(&bencode).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();

        assert!(Torrent::open(file.path()).is_err());
    }
}
