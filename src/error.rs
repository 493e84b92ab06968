//! Error types for the download engine.
//!
//! Session-level failures (handshake, protocol, I/O) are recoverable: the
//! affected peer is dropped and the download continues. Metadata and disk
//! errors are surfaced to the caller as distinct variants.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The .torrent file could not be decoded or is missing required fields.
    #[error("invalid torrent metadata: {0}")]
    Metainfo(String),

    /// A tracker announce failed (timeout, malformed response, bad URL).
    #[error("tracker announce failed: {0}")]
    Tracker(String),

    /// The peer handshake could not be completed or did not validate.
    #[error("handshake failed: {0}")]
    Handshake(&'static str),

    /// The peer sent a frame that violates the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// A socket operation failed (connection reset, EOF, send failure).
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// A verified piece could not be written to its output file.
    #[error("could not write to {path:?}: {source}")]
    Disk {
        path: PathBuf,
        source: std::io::Error,
    },
}
