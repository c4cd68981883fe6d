//! Incremental line framer for link-layer byte streams.
//!
//! Packet radio links deliver bytes in whatever chunks the remote TNC felt
//! like sending, so a single typed line can arrive as one packet, one byte
//! per packet, or glued to the tail of the previous line. The framer hides
//! all of that:
//!
//! ```text
//! feed(b"hel") -> []
//! feed(b"lo\r") -> []          (trailing CR: might be half of CR+LF)
//! feed(b"\nnext\n") -> ["hello", "next"]
//! ```
//!
//! Three terminators are recognized: CR+LF, LF, and bare CR. The earliest
//! one in the buffer wins, and CR+LF is always consumed as a unit.
//!
//! Bytes are decoded as Latin-1, which maps every byte to the code point of
//! the same value, so decoding can never fail.

/// Default maximum number of buffered bytes without a line terminator.
pub const DEFAULT_MAX_LINE_BYTES: usize = 4096;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Error returned when a sender exceeds the accumulator limit without
/// ever terminating a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTooLong {
    /// Bytes buffered when the limit was hit.
    pub buffered: usize,
    /// Configured limit.
    pub limit: usize,
}

impl std::fmt::Display for LineTooLong {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Line too long: {} bytes buffered without terminator (max {})",
            self.buffered, self.limit
        )
    }
}

impl std::error::Error for LineTooLong {}

/// Per-session line reassembly state.
///
/// Feed raw chunks via [`LineFramer::feed`] and collect complete, decoded,
/// trimmed, non-empty lines.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_len: usize,
    /// Set after a trailing CR was resolved early by
    /// [`LineFramer::flush_pending_cr`]. An LF arriving as the next byte
    /// belongs to that CR and is dropped.
    skip_lf: bool,
}

impl LineFramer {
    /// Create a framer with the given accumulator limit.
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len: max_len.max(1),
            skip_lf: false,
        }
    }

    /// Feed bytes into the framer and extract all complete lines.
    ///
    /// Incomplete data stays buffered for the next call. Whitespace-only
    /// lines are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`LineTooLong`] if the unterminated remainder exceeds the
    /// configured limit. The framer should be discarded afterwards.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<String>, LineTooLong> {
        let mut bytes = bytes;
        if self.skip_lf && !bytes.is_empty() {
            self.skip_lf = false;
            if bytes[0] == LF {
                bytes = &bytes[1..];
            }
        }
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;

        while let Some(pos) = self.buf[start..].iter().position(|&b| b == CR || b == LF) {
            let end = start + pos;
            let width = if self.buf[end] == LF {
                1
            } else if end + 1 < self.buf.len() {
                if self.buf[end + 1] == LF { 2 } else { 1 }
            } else {
                // Trailing CR, wait for the next byte to tell CR from CR+LF
                break;
            };

            if let Some(line) = decode_line(&self.buf[start..end]) {
                lines.push(line);
            }
            start = end + width;
        }

        self.buf.drain(..start);

        if self.buf.len() > self.max_len {
            return Err(LineTooLong {
                buffered: self.buf.len(),
                limit: self.max_len,
            });
        }

        Ok(lines)
    }

    /// True if the buffer ends in a CR that may still be half of a CR+LF.
    pub fn has_pending_cr(&self) -> bool {
        self.buf.last() == Some(&CR)
    }

    /// Resolve a trailing CR as a bare-CR terminator.
    ///
    /// Returns the line it terminates (if non-blank). An LF arriving as the
    /// very next byte is swallowed, so the overall line sequence is the same
    /// as if the framer had waited.
    pub fn flush_pending_cr(&mut self) -> Option<String> {
        if !self.has_pending_cr() {
            return None;
        }
        let end = self.buf.len() - 1;
        let line = decode_line(&self.buf[..end]);
        self.buf.clear();
        self.skip_lf = true;
        line
    }

    /// Resolve end of stream.
    ///
    /// A pending CR-terminated line is returned; any unterminated remainder
    /// is discarded since the sender never completed it.
    pub fn finish(&mut self) -> Option<String> {
        let line = self.flush_pending_cr();
        self.buf.clear();
        self.skip_lf = false;
        line
    }

    /// Returns true if the framer has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

/// Decode a Latin-1 segment and trim it. `None` for blank lines.
fn decode_line(segment: &[u8]) -> Option<String> {
    let text = decode_latin1(segment);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Decode bytes as Latin-1 (ISO-8859-1). Never fails.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Encode text as Latin-1, dropping characters above U+00FF.
pub fn encode_latin1(text: &str) -> Vec<u8> {
    text.chars()
        .filter_map(|c| u8::try_from(u32::from(c)).ok())
        .collect()
}
