//! Peer wire message codec.
//!
//! Every post-handshake message is a 4-byte big-endian length prefix
//! followed by that many payload bytes; the first payload byte is the
//! message id. A zero-length frame is a keep-alive.
//!
//! | ID | Name           | Payload                        |
//! |----|----------------|--------------------------------|
//! | 0  | CHOKE          | none                           |
//! | 1  | UNCHOKE        | none                           |
//! | 2  | INTERESTED     | none                           |
//! | 3  | NOT INTERESTED | none                           |
//! | 4  | HAVE           | piece index                    |
//! | 5  | BITFIELD       | raw bitfield bytes             |
//! | 6  | REQUEST        | index, begin, length           |
//! | 7  | PIECE          | index, begin, block bytes      |
//!
//! Frames arrive in arbitrary fragments over TCP, so extraction works
//! against an accumulating per-session buffer and only removes bytes once
//! a complete frame is present.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

const MESSAGE_CHOKE: u8 = 0;
const MESSAGE_UNCHOKE: u8 = 1;
const MESSAGE_INTERESTED: u8 = 2;
const MESSAGE_NOT_INTERESTED: u8 = 3;
const MESSAGE_HAVE: u8 = 4;
const MESSAGE_BITFIELD: u8 = 5;
const MESSAGE_REQUEST: u8 = 6;
const MESSAGE_PIECE: u8 = 7;

/// A decoded peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Vec<u8> },
    /// A message id outside the base protocol (extension traffic); skipped.
    Unknown(u8),
}

impl Message {
    /// Serializes the message with its length prefix.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (id, payload) = match self {
            Message::KeepAlive => {
                // Keep-alive is a bare zero-length prefix
                return Ok(vec![0; 4]);
            }
            Message::Choke => (MESSAGE_CHOKE, vec![]),
            Message::Unchoke => (MESSAGE_UNCHOKE, vec![]),
            Message::Interested => (MESSAGE_INTERESTED, vec![]),
            Message::NotInterested => (MESSAGE_NOT_INTERESTED, vec![]),
            Message::Have(index) => {
                let mut payload = vec![];
                payload.write_u32::<BigEndian>(*index)?;
                (MESSAGE_HAVE, payload)
            }
            Message::Bitfield(bits) => (MESSAGE_BITFIELD, bits.clone()),
            Message::Request {
                index,
                begin,
                length,
            } => {
                let mut payload = vec![];
                payload.write_u32::<BigEndian>(*index)?;
                payload.write_u32::<BigEndian>(*begin)?;
                payload.write_u32::<BigEndian>(*length)?;
                (MESSAGE_REQUEST, payload)
            }
            Message::Piece { index, begin, data } => {
                let mut payload = vec![];
                payload.write_u32::<BigEndian>(*index)?;
                payload.write_u32::<BigEndian>(*begin)?;
                payload.extend_from_slice(data);
                (MESSAGE_PIECE, payload)
            }
            Message::Unknown(_) => return Err(Error::Protocol("cannot encode unknown message")),
        };

        let mut serialized: Vec<u8> = vec![];
        serialized.write_u32::<BigEndian>(1 + payload.len() as u32)?;
        serialized.push(id);
        serialized.extend_from_slice(&payload);

        Ok(serialized)
    }

    /// Parses a complete frame (length prefix already stripped).
    pub fn parse(frame: &[u8]) -> Result<Message> {
        if frame.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = frame[0];
        let payload = &frame[1..];

        let message = match id {
            MESSAGE_CHOKE => Message::Choke,
            MESSAGE_UNCHOKE => Message::Unchoke,
            MESSAGE_INTERESTED => Message::Interested,
            MESSAGE_NOT_INTERESTED => Message::NotInterested,
            MESSAGE_HAVE => {
                if payload.len() != 4 {
                    return Err(Error::Protocol("malformed HAVE payload"));
                }
                let mut cursor = Cursor::new(payload);
                Message::Have(cursor.read_u32::<BigEndian>()?)
            }
            MESSAGE_BITFIELD => Message::Bitfield(payload.to_vec()),
            MESSAGE_REQUEST => {
                if payload.len() != 12 {
                    return Err(Error::Protocol("malformed REQUEST payload"));
                }
                let mut cursor = Cursor::new(payload);
                Message::Request {
                    index: cursor.read_u32::<BigEndian>()?,
                    begin: cursor.read_u32::<BigEndian>()?,
                    length: cursor.read_u32::<BigEndian>()?,
                }
            }
            MESSAGE_PIECE => {
                if payload.len() < 8 {
                    return Err(Error::Protocol("malformed PIECE payload"));
                }
                let mut cursor = Cursor::new(&payload[0..8]);
                Message::Piece {
                    index: cursor.read_u32::<BigEndian>()?,
                    begin: cursor.read_u32::<BigEndian>()?,
                    data: payload[8..].to_vec(),
                }
            }
            other => Message::Unknown(other),
        };

        Ok(message)
    }
}

/// Largest frame length we accept. The biggest legitimate frames are a
/// PIECE carrying one 16 KiB block and the BITFIELD of a very large
/// torrent; anything bigger is a hostile or broken length prefix.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Extracts the next complete frame from the receive buffer, if any.
///
/// Returns the frame payload (length prefix stripped) and removes it from
/// the buffer. `Ok(None)` means the buffer holds only a partial frame. A
/// length prefix above `MAX_FRAME_LEN` is an error, so a peer cannot make
/// the buffer grow without bound by announcing a giant frame.
pub fn extract_frame(buffer: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
    if buffer.len() < 4 {
        return Ok(None);
    }

    let mut cursor = Cursor::new(&buffer[0..4]);
    let frame_len = cursor.read_u32::<BigEndian>()? as usize;
    if frame_len > MAX_FRAME_LEN {
        return Err(Error::Protocol("frame length exceeds limit"));
    }
    if buffer.len() < 4 + frame_len {
        return Ok(None);
    }

    let frame = buffer[4..4 + frame_len].to_vec();
    buffer.drain(0..4 + frame_len);

    Ok(Some(frame))
}
