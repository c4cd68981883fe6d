//! AGWPE adapter for Direwolf.
//!
//! Direwolf exposes AX.25 connected mode over the AGW Packet Engine TCP
//! API. One TCP connection carries every station; this module demultiplexes
//! it into one [`Incoming`](crate::transport::Incoming) link per station.
//!
//! # Architecture
//!
//! ```text
//! Direwolf                      AgwpeAcceptor
//! ┌──────────┐   AGWPE frames  ┌──────────────────────────┐
//! │ AX.25    │◄───────────────►│ read task: C/D/d demux   │──► Incoming per station
//! │ sessions │   over TCP      │ write task: frame queue  │◄── D/d from link writers
//! └──────────┘                 └──────────────────────────┘
//! ```
//!
//! See [`frame`] for the wire codec.

pub mod client;
pub mod frame;

pub use client::AgwpeAcceptor;

/// Errors from the AGWPE adapter.
#[derive(Debug)]
pub enum AgwpeError {
    /// A header announced a payload above the size limit.
    FrameTooLarge(u32),
    /// Direwolf did not answer in time.
    Timeout(&'static str),
    /// Direwolf refused to register our callsign.
    RegistrationRefused(String),
    /// The TCP connection closed during startup.
    Disconnected,
    /// Socket failure.
    Io(std::io::Error),
}

impl std::fmt::Display for AgwpeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameTooLarge(len) => write!(f, "AGWPE frame too large: {len} bytes"),
            Self::Timeout(what) => write!(f, "Timed out waiting for {what}"),
            Self::RegistrationRefused(call) => write!(f, "Failed to register callsign: {call}"),
            Self::Disconnected => write!(f, "Direwolf closed the connection"),
            Self::Io(e) => write!(f, "AGWPE I/O error: {e}"),
        }
    }
}

impl std::error::Error for AgwpeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for AgwpeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
