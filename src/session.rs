//! Per-peer protocol session.
//!
//! A `PeerSession` owns one TCP connection to one remote peer. It performs
//! the handshake on connect, then exposes a bounded-time polling read that
//! drains complete frames from its receive buffer. Control messages
//! (choke, unchoke, have, bitfield, ...) are consumed internally and only
//! update session state; PIECE messages are handed back to the caller,
//! which forwards them to the piece store.
//!
//! Any socket error, EOF or malformed frame closes the session. Closed is
//! terminal; there is no reconnection.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use log::debug;

use crate::bitfield::Bitfield;
use crate::error::{Error, Result};
use crate::handshake::{Handshake, HANDSHAKE_LEN};
use crate::message::{self, Message};
use crate::peer::Peer;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// A block payload decoded from a PIECE message.
#[derive(Debug, PartialEq, Eq)]
pub struct IncomingBlock {
    pub piece_index: u32,
    pub offset: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Handshaking,
    Active,
    Closed,
}

/// One live connection to a remote peer.
pub struct PeerSession {
    peer: Peer,
    stream: TcpStream,
    state: SessionState,
    peer_choking: bool,
    peer_interested: bool,
    am_interested: bool,
    /// The peer's advertised pieces; absent until a bitfield or have arrives
    bitfield: Option<Bitfield>,
    /// Unconsumed bytes received from the socket
    buffer: Vec<u8>,
    piece_count: usize,
}

impl PeerSession {
    /// Connects to a peer and performs the handshake.
    ///
    /// A successful handshake is the only way into the active state. On
    /// any failure the socket is released and the error is returned; the
    /// peer is simply not usable.
    pub fn connect(
        peer: Peer,
        info_hash: &[u8],
        peer_id: &[u8],
        piece_count: usize,
    ) -> Result<PeerSession> {
        let stream = TcpStream::connect_timeout(&peer.addr(), CONNECT_TIMEOUT)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        stream.set_read_timeout(Some(CONNECT_TIMEOUT))?;

        let mut session = PeerSession {
            peer,
            stream,
            state: SessionState::Handshaking,
            peer_choking: true,
            peer_interested: false,
            am_interested: false,
            bitfield: None,
            buffer: vec![],
            piece_count,
        };

        if let Err(e) = session.exchange_handshake(info_hash, peer_id) {
            session.close();
            return Err(e);
        }

        // Per-poll bound; a timed-out read is "no message yet", not a failure
        session.stream.set_read_timeout(Some(READ_TIMEOUT))?;
        session.state = SessionState::Active;
        debug!("handshake complete with {}", session.peer);

        Ok(session)
    }

    fn exchange_handshake(&mut self, info_hash: &[u8], peer_id: &[u8]) -> Result<()> {
        let frame = Handshake::new(info_hash.to_vec(), peer_id.to_vec()).serialize();
        self.stream
            .write_all(&frame)
            .map_err(|_| Error::Handshake("could not send handshake"))?;

        let mut buf = [0; HANDSHAKE_LEN];
        self.stream
            .read_exact(&mut buf)
            .map_err(|_| Error::Handshake("handshake response too short"))?;

        let reply = Handshake::parse(&buf)?;
        if reply.info_hash != info_hash {
            return Err(Error::Handshake("info hash mismatch"));
        }

        Ok(())
    }

    /// Polls the connection for the next block payload.
    ///
    /// Appends whatever bytes are available (bounded by the read timeout)
    /// to the session buffer, then decodes every complete frame in it.
    /// Control messages update session flags; the first PIECE message is
    /// returned. `Ok(None)` means no block is available yet.
    pub fn poll_block(&mut self) -> Result<Option<IncomingBlock>> {
        if self.state != SessionState::Active {
            return Err(Error::Protocol("session is closed"));
        }

        let mut chunk = [0; 4096];
        match self.stream.read(&mut chunk) {
            Ok(0) => {
                self.close();
                return Err(Error::Protocol("peer closed the connection"));
            }
            Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                self.close();
                return Err(Error::Io(e));
            }
        }

        loop {
            let frame = match message::extract_frame(&mut self.buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            };
            let decoded = match Message::parse(&frame) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            };

            match decoded {
                Message::KeepAlive => {}
                Message::Choke => self.peer_choking = true,
                Message::Unchoke => self.peer_choking = false,
                Message::Interested => self.peer_interested = true,
                Message::NotInterested => self.peer_interested = false,
                Message::Have(index) => {
                    // Tolerate have before bitfield by starting from empty
                    let piece_count = self.piece_count;
                    self.bitfield
                        .get_or_insert_with(|| Bitfield::new(piece_count))
                        .set(index as usize);
                }
                Message::Bitfield(bits) => self.bitfield = Some(Bitfield::from_bytes(bits)),
                Message::Request { .. } => {
                    // Download-only client; we never serve blocks
                    debug!("ignoring block request from {}", self.peer);
                }
                Message::Piece { index, begin, data } => {
                    return Ok(Some(IncomingBlock {
                        piece_index: index,
                        offset: begin,
                        data,
                    }));
                }
                Message::Unknown(id) => {
                    debug!("ignoring unknown message id {} from {}", id, self.peer);
                }
            }
        }

        Ok(None)
    }

    /// Tells the peer we want to download. Sent at most once per session.
    pub fn send_interested(&mut self) -> Result<()> {
        if self.am_interested {
            return Ok(());
        }

        self.send(&Message::Interested)?;
        self.am_interested = true;

        Ok(())
    }

    /// Requests one block. Fire-and-forget; the response arrives later as
    /// a PIECE message through `poll_block`.
    pub fn send_request(&mut self, piece_index: u32, offset: u32, length: u32) -> Result<()> {
        debug!(
            "requesting piece {} [{}:{}] from {}",
            piece_index,
            offset,
            offset + length,
            self.peer
        );
        self.send(&Message::Request {
            index: piece_index,
            begin: offset,
            length,
        })
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        if self.state != SessionState::Active {
            return Err(Error::Protocol("session is closed"));
        }

        let encoded = message.encode()?;
        if let Err(e) = self.stream.write_all(&encoded) {
            self.close();
            return Err(Error::Io(e));
        }

        Ok(())
    }

    /// Shuts the socket down and marks the session closed. Terminal.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            let _ = self.stream.shutdown(Shutdown::Both);
            self.state = SessionState::Closed;
        }
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    #[allow(dead_code)]
    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    pub fn bitfield(&self) -> Option<&Bitfield> {
        self.bitfield.as_ref()
    }

    /// A second handle to the socket, used by the stop path to force any
    /// in-flight read to fail.
    pub fn stream_handle(&self) -> Result<TcpStream> {
        Ok(self.stream.try_clone()?)
    }
}
