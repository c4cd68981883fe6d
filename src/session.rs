//! Per-station session state and I/O loops.
//!
//! A session moves through a fixed lifecycle:
//!
//! ```text
//! Connecting ──banner──► Greeting ──history + prompt──► Active
//!                                                          │
//!            EOF / link error / timeout / shutdown         ▼
//!                              Closed ◄─────────────── Closing
//! ```
//!
//! The [`Session`] value itself is shared (`Arc`) between the registry and
//! the dispatcher. Its byte stream is driven by two tasks:
//!
//! - [`read_loop`] owns the [`LineFramer`] and turns raw chunks into
//!   [`RelayEvent::Line`] events.
//! - [`write_loop`] drains the session's outbound queue onto the link.
//!
//! Both stop as soon as the session's cancellation token fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::constants::CR_GRACE_PERIOD;
use crate::events::{CloseReason, RelayEvent};
use crate::framer::{encode_latin1, LineFramer};
use crate::store::Message;
use crate::transport::{LinkReader, LinkWriter};

/// Lifecycle state of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Accepted, nothing sent yet.
    Connecting,
    /// Banner sent, history pending.
    Greeting,
    /// Handshake complete, exchanging messages.
    Active,
    /// Shutting down, no further writes.
    Closing,
    /// Resources released and removed from the registry.
    Closed,
}

/// Why text could not be queued for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The session is closing or closed.
    Inactive,
    /// The outbound queue is full; the recipient is not keeping up.
    Stalled,
    /// The writer task has gone away.
    Closed,
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactive => write!(f, "Session inactive"),
            Self::Stalled => write!(f, "Outbound queue full"),
            Self::Closed => write!(f, "Writer closed"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Write-only handle to a session's link.
///
/// Backed by a bounded queue; the matching receiver is drained by
/// [`write_loop`]. Queueing never blocks, so a stalled recipient cannot hold
/// up a broadcast.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Bytes>,
}

impl Outbound {
    /// Create a sink and the receiver its writer task should drain.
    pub fn channel(depth: usize) -> (Self, Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    fn push(&self, data: Bytes) -> Result<(), DeliveryError> {
        self.tx.try_send(data).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Stalled,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// A connected station.
#[derive(Debug)]
pub struct Session {
    identity: String,
    serial: u64,
    system_identity: String,
    state: Mutex<SessionState>,
    active: AtomicBool,
    outbound: Outbound,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session in the `Connecting` state.
    pub fn new(
        identity: impl Into<String>,
        serial: u64,
        system_identity: impl Into<String>,
        outbound: Outbound,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity: identity.into(),
            serial,
            system_identity: system_identity.into(),
            state: Mutex::new(SessionState::Connecting),
            active: AtomicBool::new(true),
            outbound,
            cancel,
        }
    }

    /// Identity of the connected station.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Serial number distinguishing reuses of the same identity.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    /// False once the session starts closing.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Token that fires when this session closes.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the handshake: banner, then history, then the first prompt.
    pub fn greet(&self, history: &[Message]) -> Result<(), DeliveryError> {
        self.advance(SessionState::Greeting);
        self.send_text(&format_banner(&self.system_identity))?;

        if !history.is_empty() {
            let mut text = String::new();
            for message in history {
                text.push_str(&format_history_line(message));
            }
            text.push_str("\r\n");
            self.send_text(&text)?;
        }

        self.advance(SessionState::Active);
        self.send_prompt()
    }

    /// Queue a broadcast line followed by this session's prompt.
    ///
    /// `line` is pre-encoded by the caller so every recipient shares one
    /// buffer.
    pub fn deliver(&self, line: &Bytes) -> Result<(), DeliveryError> {
        self.send_bytes(line.clone())?;
        self.send_prompt()
    }

    /// Queue this session's prompt.
    pub fn send_prompt(&self) -> Result<(), DeliveryError> {
        self.send_text(&format_prompt(&self.identity))
    }

    /// Queue arbitrary text (Latin-1 encoded).
    pub fn send_text(&self, text: &str) -> Result<(), DeliveryError> {
        self.send_bytes(Bytes::from(encode_latin1(text)))
    }

    fn send_bytes(&self, data: Bytes) -> Result<(), DeliveryError> {
        if !self.is_active() {
            return Err(DeliveryError::Inactive);
        }
        self.outbound.push(data)
    }

    /// Move to `Closing`: stop accepting writes and cancel the I/O tasks.
    ///
    /// Returns `false` if the session was already closing.
    pub fn begin_close(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        self.advance(SessionState::Closing);
        self.cancel.cancel();
        was_active
    }

    /// Move to the terminal `Closed` state.
    pub fn mark_closed(&self) {
        self.begin_close();
        self.advance(SessionState::Closed);
    }

    fn advance(&self, to: SessionState) {
        let mut state = self.lock_state();
        if to > *state {
            log::debug!("[Session] {} {:?} -> {:?}", self.identity, *state, to);
            *state = to;
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// `Welcome to {system}\r\n`
pub fn format_banner(system_identity: &str) -> String {
    format!("Welcome to {system_identity}\r\n")
}

/// `[HH:MM] origin: text\r\n`
pub fn format_history_line(message: &Message) -> String {
    format!("{message}\r\n")
}

/// `\r\n[HH:MM] origin: text\r\n`
pub fn format_broadcast(message: &Message) -> String {
    format!("\r\n{message}\r\n")
}

/// `{identity}> ` (no line terminator)
pub fn format_prompt(identity: &str) -> String {
    format!("{identity}> ")
}

/// Read loop - feeds link bytes through the framer and emits line events.
///
/// Ends on EOF, link error, oversized line, or cancellation. Except for
/// cancellation, a [`RelayEvent::Closed`] is emitted on the way out.
pub(crate) async fn read_loop(
    identity: String,
    serial: u64,
    mut reader: Box<dyn LinkReader>,
    mut framer: LineFramer,
    events: UnboundedSender<RelayEvent>,
    cancel: CancellationToken,
) {
    let emit = |text: String| {
        let _ = events.send(RelayEvent::Line {
            identity: identity.clone(),
            serial,
            text,
        });
    };

    let reason = loop {
        let next = if framer.has_pending_cr() {
            tokio::select! {
                () = cancel.cancelled() => return,
                result = tokio::time::timeout(CR_GRACE_PERIOD, reader.read()) => match result {
                    Ok(next) => next,
                    Err(_) => {
                        // Sender paused after a bare CR; it was a terminator
                        if let Some(line) = framer.flush_pending_cr() {
                            emit(line);
                        }
                        continue;
                    }
                },
            }
        } else {
            tokio::select! {
                () = cancel.cancelled() => return,
                next = reader.read() => next,
            }
        };

        match next {
            Ok(Some(chunk)) => match framer.feed(&chunk) {
                Ok(lines) => lines.into_iter().for_each(&emit),
                Err(e) => {
                    log::warn!("[Session] {}: {e}", identity);
                    break CloseReason::LineTooLong;
                }
            },
            Ok(None) => {
                if let Some(line) = framer.finish() {
                    emit(line);
                }
                break CloseReason::Eof;
            }
            Err(e) => {
                log::warn!("[Session] Read error for {}: {e}", identity);
                break CloseReason::Transport(e.to_string());
            }
        }
    };

    let _ = events.send(RelayEvent::Closed {
        identity,
        serial,
        reason,
    });
}

/// Write loop - drains the outbound queue onto the link.
///
/// Every write is bounded by `write_timeout`. On failure a
/// [`RelayEvent::Closed`] is emitted. The link is closed on exit.
pub(crate) async fn write_loop(
    identity: String,
    serial: u64,
    mut writer: Box<dyn LinkWriter>,
    mut outbound_rx: Receiver<Bytes>,
    write_timeout: Duration,
    events: UnboundedSender<RelayEvent>,
    cancel: CancellationToken,
) {
    let failure = loop {
        let data = tokio::select! {
            biased;
            () = cancel.cancelled() => break None,
            data = outbound_rx.recv() => match data {
                Some(data) => data,
                None => break None,
            },
        };

        let result = tokio::select! {
            () = cancel.cancelled() => break None,
            result = tokio::time::timeout(write_timeout, writer.write(&data)) => result,
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!("[Session] Write error for {}: {e}", identity);
                break Some(CloseReason::Transport(e.to_string()));
            }
            Err(_) => {
                log::warn!("[Session] Write to {} timed out after {:?}", identity, write_timeout);
                break Some(CloseReason::WriteTimeout);
            }
        }
    };

    writer.close().await;

    if let Some(reason) = failure {
        let _ = events.send(RelayEvent::Closed {
            identity,
            serial,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::stream::StreamLink;
    use chrono::{Local, TimeZone};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn session(identity: &str, depth: usize) -> (Session, Receiver<Bytes>) {
        let (outbound, rx) = Outbound::channel(depth);
        let session = Session::new(identity, 1, "FOX-10", outbound, CancellationToken::new());
        (session, rx)
    }

    fn drain(rx: &mut Receiver<Bytes>) -> String {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8(out).unwrap()
    }

    fn message(origin: &str, text: &str) -> Message {
        let ts = Local.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        Message::with_timestamp(origin, text, ts)
    }

    #[test]
    fn test_greet_without_history() {
        let (session, mut rx) = session("W1ABC", 8);
        assert_eq!(session.state(), SessionState::Connecting);
        session.greet(&[]).unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(drain(&mut rx), "Welcome to FOX-10\r\nW1ABC> ");
    }

    #[test]
    fn test_greet_with_history_is_chronological() {
        let (session, mut rx) = session("W1ABC", 8);
        session
            .greet(&[message("K2XYZ", "first"), message("N3DEF", "second")])
            .unwrap();
        assert_eq!(
            drain(&mut rx),
            "Welcome to FOX-10\r\n\
             [12:00] K2XYZ: first\r\n\
             [12:00] N3DEF: second\r\n\
             \r\n\
             W1ABC> "
        );
    }

    #[test]
    fn test_deliver_sends_line_then_prompt() {
        let (session, mut rx) = session("B", 8);
        let line = Bytes::from(format_broadcast(&message("A", "hello")));
        session.deliver(&line).unwrap();
        assert_eq!(drain(&mut rx), "\r\n[12:00] A: hello\r\nB> ");
    }

    #[test]
    fn test_full_queue_reports_stalled() {
        let (session, _rx) = session("W1ABC", 1);
        session.send_text("one").unwrap();
        assert_eq!(session.send_text("two"), Err(DeliveryError::Stalled));
    }

    #[test]
    fn test_closed_session_refuses_writes() {
        let (session, mut rx) = session("W1ABC", 8);
        session.greet(&[]).unwrap();
        drain(&mut rx);

        assert!(session.begin_close());
        assert!(!session.begin_close());
        assert_eq!(session.state(), SessionState::Closing);
        assert!(session.cancel_token().is_cancelled());
        assert_eq!(session.send_prompt(), Err(DeliveryError::Inactive));

        session.mark_closed();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_state_never_moves_backwards() {
        let (session, _rx) = session("W1ABC", 8);
        session.mark_closed();
        // Greeting after close must not revive the session
        assert_eq!(session.greet(&[]), Err(DeliveryError::Inactive));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_outbound_text_is_latin1() {
        let (session, mut rx) = session("W1ABC", 8);
        session.send_text("caf\u{e9}\u{2603}").unwrap();
        let chunk = rx.try_recv().unwrap();
        assert_eq!(&chunk[..], b"caf\xe9");
    }

    #[tokio::test]
    async fn test_read_loop_emits_lines_and_close() {
        let (local, mut remote) = tokio::io::duplex(256);
        let incoming = StreamLink::incoming("W1ABC", local);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(read_loop(
            "W1ABC".to_string(),
            7,
            incoming.reader,
            LineFramer::default(),
            tx,
            CancellationToken::new(),
        ));

        remote.write_all(b"hel").await.unwrap();
        remote.write_all(b"lo\r\n  \r\nbye\n").await.unwrap();
        drop(remote);
        handle.await.unwrap();

        let mut lines = Vec::new();
        let mut closed = None;
        while let Some(event) = rx.recv().await {
            match event {
                RelayEvent::Line { text, serial, .. } => {
                    assert_eq!(serial, 7);
                    lines.push(text);
                }
                RelayEvent::Closed { reason, .. } => closed = Some(reason),
                RelayEvent::Accepted(_) => panic!("unexpected Accepted"),
            }
        }
        assert_eq!(lines, vec!["hello", "bye"]);
        assert_eq!(closed, Some(CloseReason::Eof));
    }

    #[tokio::test]
    async fn test_read_loop_flushes_bare_cr_after_pause() {
        let (local, mut remote) = tokio::io::duplex(256);
        let incoming = StreamLink::incoming("W1ABC", local);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(read_loop(
            "W1ABC".to_string(),
            1,
            incoming.reader,
            LineFramer::default(),
            tx,
            cancel.clone(),
        ));

        remote.write_all(b"hello\r").await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("Timed out waiting for flushed line")
            .unwrap();
        match event {
            RelayEvent::Line { text, .. } => assert_eq!(text, "hello"),
            other => panic!("Expected Line, got: {other:?}"),
        }

        // The late LF belongs to the flushed CR
        remote.write_all(b"\nnext\r\n").await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            RelayEvent::Line { text, .. } => assert_eq!(text, "next"),
            other => panic!("Expected Line, got: {other:?}"),
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_loop_closes_on_line_too_long() {
        let (local, mut remote) = tokio::io::duplex(256);
        let incoming = StreamLink::incoming("W1ABC", local);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(read_loop(
            "W1ABC".to_string(),
            1,
            incoming.reader,
            LineFramer::new(16),
            tx,
            CancellationToken::new(),
        ));

        remote.write_all(&[b'x'; 32]).await.unwrap();
        handle.await.unwrap();

        match rx.recv().await.unwrap() {
            RelayEvent::Closed { reason, .. } => assert_eq!(reason, CloseReason::LineTooLong),
            other => panic!("Expected Closed, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_unblocks_pending_read() {
        let (local, _remote) = tokio::io::duplex(256);
        let incoming = StreamLink::incoming("W1ABC", local);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(read_loop(
            "W1ABC".to_string(),
            1,
            incoming.reader,
            LineFramer::default(),
            tx,
            cancel.clone(),
        ));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("read loop did not stop on cancel")
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_write_loop_writes_in_order() {
        let (local, mut remote) = tokio::io::duplex(256);
        let incoming = StreamLink::incoming("W1ABC", local);
        let (outbound, outbound_rx) = Outbound::channel(8);
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(write_loop(
            "W1ABC".to_string(),
            1,
            incoming.writer,
            outbound_rx,
            Duration::from_secs(5),
            tx,
            cancel.clone(),
        ));

        outbound.push(Bytes::from_static(b"one ")).unwrap();
        outbound.push(Bytes::from_static(b"two")).unwrap();

        let mut buf = [0u8; 7];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one two");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_loop_times_out_on_stalled_link() {
        // Tiny duplex buffer that nobody drains
        let (local, _remote) = tokio::io::duplex(4);
        let incoming = StreamLink::incoming("W1ABC", local);
        let (outbound, outbound_rx) = Outbound::channel(8);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(write_loop(
            "W1ABC".to_string(),
            3,
            incoming.writer,
            outbound_rx,
            Duration::from_millis(50),
            tx,
            CancellationToken::new(),
        ));

        outbound.push(Bytes::from_static(b"far more than four bytes")).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("write loop did not time out")
            .unwrap();

        match rx.recv().await.unwrap() {
            RelayEvent::Closed { serial, reason, .. } => {
                assert_eq!(serial, 3);
                assert_eq!(reason, CloseReason::WriteTimeout);
            }
            other => panic!("Expected Closed, got: {other:?}"),
        }
    }
}
