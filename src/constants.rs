//! Application-wide constants for fox-bbs.
//!
//! Timing and protocol limits that are not worth a config knob.

use std::time::Duration;

// ============================================================================
// Sessions
// ============================================================================

/// How long the reader waits after a trailing CR before treating it as a
/// bare-CR terminator.
///
/// Many TNC terminal programs end lines with CR only. Without this grace
/// period their last line would sit in the framer until the next packet.
pub const CR_GRACE_PERIOD: Duration = Duration::from_millis(250);

/// Notice sent to a connection refused for a duplicate identity.
pub const DUPLICATE_NOTICE: &str = "Callsign already connected\r\n";

/// Smallest outbound queue that fits a handshake with history (banner,
/// history block, prompt) plus one broadcast line and its prompt.
pub const MIN_OUTBOUND_QUEUE_DEPTH: usize = 5;

/// Upper bound for delivering [`DUPLICATE_NOTICE`] before hanging up.
pub const DUPLICATE_NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Shutdown
// ============================================================================

/// Graceful shutdown budget before the process exits anyway.
pub const SHUTDOWN_WATCHDOG: Duration = Duration::from_secs(3);

// ============================================================================
// AGWPE
// ============================================================================

/// Time allowed for Direwolf to answer the version probe after connecting.
pub const ENGINE_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for Direwolf to confirm callsign registration.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest payload accepted in one AGWPE frame.
pub const MAX_AGW_DATA_LEN: u32 = 64 * 1024;

/// Maximum bytes per outbound connected-data frame (AX.25 PACLEN).
pub const PACLEN: usize = 256;

/// Per-connection inbound queue depth inside the AGWPE adapter.
pub const AGW_LINK_QUEUE: usize = 64;
