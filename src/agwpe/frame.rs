//! AGWPE wire codec.
//!
//! Every frame is a fixed 36-byte header followed by `data_len` payload
//! bytes:
//!
//! ```text
//! [u8 port][3 reserved][u8 kind][1 reserved][u8 pid][1 reserved]
//! [10 call_from][10 call_to][u32 LE data_len][u32 user]
//! ```
//!
//! Callsign fields are ASCII, NUL padded.

use crate::constants::MAX_AGW_DATA_LEN;

use super::AgwpeError;

/// Header size in bytes.
pub const HEADER_LEN: usize = 36;

/// Width of each callsign field.
const CALL_LEN: usize = 10;

/// PID for plain connected-mode text (no layer 3).
pub const PID_NO_LAYER3: u8 = 0xF0;

/// Frame kind constants (the header's ASCII `DataKind` byte).
pub mod kind {
    /// Version request / reply.
    pub const VERSION: u8 = b'R';
    /// Register callsign request / reply.
    pub const REGISTER: u8 = b'X';
    /// Unregister callsign.
    pub const UNREGISTER: u8 = b'x';
    /// Connection established notice.
    pub const CONNECTED: u8 = b'C';
    /// Connected-mode data.
    pub const DATA: u8 = b'D';
    /// Disconnect request / notice.
    pub const DISCONNECT: u8 = b'd';
}

/// A decoded AGWPE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgwFrame {
    /// Radio port (Direwolf channel).
    pub port: u8,
    /// Frame kind, see [`kind`].
    pub kind: u8,
    /// AX.25 protocol id.
    pub pid: u8,
    /// Source callsign.
    pub call_from: String,
    /// Destination callsign.
    pub call_to: String,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl AgwFrame {
    fn bare(kind: u8) -> Self {
        Self {
            port: 0,
            kind,
            pid: 0,
            call_from: String::new(),
            call_to: String::new(),
            data: Vec::new(),
        }
    }

    /// Version request, used as a readiness probe.
    pub fn version_request() -> Self {
        Self::bare(kind::VERSION)
    }

    /// Register `callsign` for incoming connections.
    pub fn register(callsign: &str) -> Self {
        Self {
            call_from: callsign.to_string(),
            ..Self::bare(kind::REGISTER)
        }
    }

    /// Unregister `callsign`.
    pub fn unregister(callsign: &str) -> Self {
        Self {
            call_from: callsign.to_string(),
            ..Self::bare(kind::UNREGISTER)
        }
    }

    /// Connected-mode data from `from` to `to`.
    pub fn data(port: u8, from: &str, to: &str, data: &[u8]) -> Self {
        Self {
            port,
            kind: kind::DATA,
            pid: PID_NO_LAYER3,
            call_from: from.to_string(),
            call_to: to.to_string(),
            data: data.to_vec(),
        }
    }

    /// Disconnect the link between `from` and `to`.
    pub fn disconnect(port: u8, from: &str, to: &str) -> Self {
        Self {
            port,
            call_from: from.to_string(),
            call_to: to.to_string(),
            ..Self::bare(kind::DISCONNECT)
        }
    }

    /// Encode into wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.data.len());
        buf.extend_from_slice(&[self.port, 0, 0, 0]);
        buf.extend_from_slice(&[self.kind, 0]);
        buf.extend_from_slice(&[self.pid, 0]);
        put_call(&mut buf, &self.call_from);
        put_call(&mut buf, &self.call_to);
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// True for a `C` notice about a station connecting to us (as opposed
    /// to confirming a connection we initiated).
    pub fn is_incoming_connect(&self) -> bool {
        self.kind == kind::CONNECTED
            && self.data.windows(b"CONNECTED With".len()).any(|w| w == b"CONNECTED With")
    }
}

fn put_call(buf: &mut Vec<u8>, call: &str) {
    let mut field = [0u8; CALL_LEN];
    // Leave room for at least one NUL terminator
    for (slot, byte) in field.iter_mut().zip(call.bytes().take(CALL_LEN - 1)) {
        *slot = byte;
    }
    buf.extend_from_slice(&field);
}

fn get_call(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).trim().to_string()
}

/// Incremental frame decoder that handles partial TCP reads.
#[derive(Debug, Default)]
pub struct AgwFrameDecoder {
    buf: Vec<u8>,
}

impl AgwFrameDecoder {
    /// Create a decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and extract all complete frames.
    ///
    /// # Errors
    ///
    /// Returns an error if a header announces an oversized payload. The
    /// stream cannot be resynchronized after that.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<AgwFrame>, AgwpeError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }

            let data_len = u32::from_le_bytes([self.buf[28], self.buf[29], self.buf[30], self.buf[31]]);
            if data_len > MAX_AGW_DATA_LEN {
                return Err(AgwpeError::FrameTooLarge(data_len));
            }

            let total = HEADER_LEN + data_len as usize;
            if self.buf.len() < total {
                break;
            }

            let header = &self.buf[..HEADER_LEN];
            frames.push(AgwFrame {
                port: header[0],
                kind: header[4],
                pid: header[6],
                call_from: get_call(&header[8..18]),
                call_to: get_call(&header[18..28]),
                data: self.buf[HEADER_LEN..total].to_vec(),
            });

            self.buf.drain(..total);
        }

        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
