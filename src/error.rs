//! Error types shared across the swarm engine.
//!
//! Errors are recovered at the lowest level that can: a connection error
//! kills that connection, a bad hash kills that transfer. Nothing here
//! aborts the download loop; only `BlockStore::complete()` does that (by
//! ending the loop normally).

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// A swarm-level error.
#[derive(Debug)]
pub enum Error {
    /// A block's content did not match its expected hash. The bytes are
    /// discarded; the sender is not credited in the rate ledger.
    BadHash,
    /// A block index was outside `[0, block_count)`.
    OutOfRange,
    /// `insert` was called for a block id that's already owned with
    /// different bytes than the first successful insert (the idempotent
    /// case is not an error).
    AlreadyOwned,
    /// `read`/`assemble` was attempted on a block/file that isn't fully
    /// owned yet.
    NotOwned,
    Incomplete,
    /// Connect, send, receive failure, or a connection-wide timeout.
    TransientNetwork(String),
    /// Malformed frame, unexpected message for the connection's state, or
    /// an oversized payload.
    ProtocolViolation(String),
    /// A block file could not be read or written.
    LocalIo(std::io::Error),
    /// The file descriptor is malformed (e.g. zero blocks, truncated hash
    /// list) or the configured base directory doesn't exist. Fatal at
    /// startup.
    Configuration(String),
    /// The tracker could not be reached. Never fatal; the peer directory
    /// retains its last-known peer set.
    TrackerUnreachable(String),
    Bencode(serde_bencode::Error),
    Json(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadHash => write!(f, "block content does not match expected hash"),
            Error::OutOfRange => write!(f, "block index out of range"),
            Error::AlreadyOwned => write!(f, "block is already owned"),
            Error::NotOwned => write!(f, "block is not owned"),
            Error::Incomplete => write!(f, "file is not yet complete"),
            Error::TransientNetwork(msg) => write!(f, "transient network error: {}", msg),
            Error::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Error::LocalIo(e) => write!(f, "local I/O error: {}", e),
            Error::Configuration(msg) => write!(f, "configuration error: {}", msg),
            Error::TrackerUnreachable(msg) => write!(f, "tracker unreachable: {}", msg),
            Error::Bencode(e) => write!(f, "bencode error: {}", e),
            Error::Json(e) => write!(f, "json error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::LocalIo(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::Bencode(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::TrackerUnreachable(e.to_string())
    }
}
