//! fox-bbs - a multi-user chat relay for AX.25 packet radio.
//!
//! Stations connect to the relay's callsign through Direwolf. Every line a
//! station sends is timestamped, kept in a short history, and broadcast to
//! everyone connected. New arrivals get a banner and the recent history.
//!
//! # Architecture
//!
//! - **Relay** - Dispatcher that owns the event loop and all membership changes
//! - **Registry** - Connected sessions plus the shared message store
//! - **Session** - One station: framer, outbound queue, reader and writer tasks
//! - **Transport** - Link abstraction with AGWPE and TCP adapters
//!
//! # Modules
//!
//! - [`relay`] - Event loop and accept task
//! - [`registry`] - Session set, broadcast fan-out, duplicate policy
//! - [`session`] - Per-station state and I/O loops
//! - [`framer`] - Line framing and Latin-1 text codec
//! - [`store`] - Bounded message history
//! - [`transport`] - Link traits, TCP and stream adapters
//! - [`agwpe`] - Direwolf AGWPE adapter
//! - [`config`] - Configuration loading and validation

// Rust guideline compliant 2026-02

pub mod agwpe;
pub mod config;
pub mod constants;
pub mod events;
pub mod framer;
pub mod registry;
pub mod relay;
pub mod session;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use events::CloseReason;
pub use registry::{DuplicatePolicy, Registry};
pub use relay::{Relay, RelaySettings};
pub use store::{Message, MessageStore};
