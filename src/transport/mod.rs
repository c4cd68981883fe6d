//! Link-layer transport abstraction.
//!
//! The relay never talks to a socket or a TNC directly. Anything that can
//! hand over connected stations implements [`Acceptor`]; each accepted
//! station is an [`Incoming`] carrying the station identity and the two
//! halves of its byte stream.
//!
//! # Implementations
//!
//! - [`crate::agwpe::AgwpeAcceptor`] - AX.25 connections via Direwolf
//! - [`tcp::TcpAcceptor`] - plain TCP for demo mode
//! - [`stream::StreamLink`] - adapts any `AsyncRead + AsyncWrite`

pub mod stream;
pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;

/// Errors on a single link. Always local to that link's session.
#[derive(Debug)]
pub enum TransportError {
    /// Underlying I/O failure.
    Io(std::io::Error),
    /// The link (or the adapter behind it) has gone away.
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Closed => write!(f, "Link closed"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Receiving half of a link.
#[async_trait]
pub trait LinkReader: Send {
    /// Wait for the next chunk of bytes.
    ///
    /// Returns `Ok(None)` at end of stream.
    async fn read(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Sending half of a link.
#[async_trait]
pub trait LinkWriter: Send {
    /// Write all of `data` to the link.
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Close the link. Best effort; errors are not reported.
    async fn close(&mut self);
}

/// Source of newly connected stations.
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next connection.
    ///
    /// Returns `Ok(None)` once the acceptor is shut down for good.
    async fn accept(&mut self) -> Result<Option<Incoming>, TransportError>;

    /// Release adapter resources (unregister, disconnect). Called once at
    /// shutdown after all sessions are closed.
    async fn shutdown(&mut self) {}
}

/// A newly accepted station.
pub struct Incoming {
    /// Identity hint supplied by the adapter (e.g. a callsign).
    pub identity: String,
    /// The adapter knows any earlier link with this identity is already
    /// gone (an AX.25 station reconnecting). The relay then retires the
    /// old session instead of treating this link as a duplicate.
    pub supersedes: bool,
    /// Receiving half.
    pub reader: Box<dyn LinkReader>,
    /// Sending half.
    pub writer: Box<dyn LinkWriter>,
}

impl std::fmt::Debug for Incoming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Incoming")
            .field("identity", &self.identity)
            .field("supersedes", &self.supersedes)
            .finish_non_exhaustive()
    }
}
