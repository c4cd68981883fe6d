//! Event channel between session tasks and the relay dispatcher.
//!
//! The accept loop and every session's reader/writer task send events
//! through a single `mpsc::UnboundedSender<RelayEvent>`. The dispatcher is
//! the only consumer and the only place registry membership and history
//! change, so sessions never call back into the registry directly.

// Rust guideline compliant 2026-02

use crate::transport::Incoming;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The station disconnected.
    Eof,
    /// Read or write failure on the link.
    Transport(String),
    /// A write did not complete within the configured timeout.
    WriteTimeout,
    /// The station sent more than the framer limit without a terminator.
    LineTooLong,
    /// A newer connection with the same identity took over.
    Replaced,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eof => write!(f, "disconnected"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::WriteTimeout => write!(f, "write timed out"),
            Self::LineTooLong => write!(f, "line too long"),
            Self::Replaced => write!(f, "replaced by newer connection"),
        }
    }
}

/// Event delivered to the relay dispatcher.
#[derive(Debug)]
pub(crate) enum RelayEvent {
    /// A station connected through the acceptor.
    Accepted(Incoming),

    /// A session's framer completed a line.
    Line {
        /// Sender identity.
        identity: String,
        /// Session serial, so lines from a replaced session are dropped.
        serial: u64,
        /// Decoded line text, untrimmed.
        text: String,
    },

    /// A session's reader or writer stopped.
    Closed {
        /// Session identity.
        identity: String,
        /// Session serial; stale events for an older session are ignored.
        serial: u64,
        /// What ended it.
        reason: CloseReason,
    },
}
