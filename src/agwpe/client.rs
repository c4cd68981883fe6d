//! Direwolf connection and per-station demultiplexing.
//!
//! [`AgwpeAcceptor`] owns the single TCP connection to Direwolf. After the
//! version probe and callsign registration succeed it spawns:
//! - Read task: decodes frames, turns `C` notices into [`Incoming`] links,
//!   routes `D` payloads to the matching link and ends links on `d`
//! - Write task: serializes outbound frames from every link writer

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::constants::{AGW_LINK_QUEUE, ENGINE_READY_TIMEOUT, PACLEN, REGISTER_TIMEOUT};
use crate::transport::{Acceptor, Incoming, LinkReader, LinkWriter, TransportError};

use super::frame::{kind, AgwFrame, AgwFrameDecoder};
use super::AgwpeError;

/// How long shutdown waits for queued frames to reach Direwolf.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Messages for the write task.
#[derive(Debug)]
enum WriterMsg {
    /// Encoded frame to send.
    Frame(Vec<u8>),
    /// Finish writing, close the socket and acknowledge.
    Flush(oneshot::Sender<()>),
}

/// Routing entry for one connected station.
#[derive(Debug)]
struct LinkEntry {
    tx: mpsc::Sender<Bytes>,
    /// Set once either side has torn the link down.
    closed: Arc<AtomicBool>,
}

type LinkTable = Arc<Mutex<HashMap<String, LinkEntry>>>;

fn lock_links(links: &LinkTable) -> MutexGuard<'_, HashMap<String, LinkEntry>> {
    links.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Accepts AX.25 connections through Direwolf's AGWPE interface.
pub struct AgwpeAcceptor {
    mycall: String,
    radio_port: u8,
    frame_tx: UnboundedSender<WriterMsg>,
    incoming_rx: UnboundedReceiver<Incoming>,
    links: LinkTable,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

impl std::fmt::Debug for AgwpeAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgwpeAcceptor")
            .field("mycall", &self.mycall)
            .field("radio_port", &self.radio_port)
            .finish_non_exhaustive()
    }
}

impl AgwpeAcceptor {
    /// Connect to Direwolf at `host:port` and register `mycall`.
    ///
    /// # Errors
    ///
    /// Fails if the connection is refused, Direwolf does not answer the
    /// version probe within the ready timeout, or registration is refused.
    pub async fn connect(
        host: &str,
        port: u16,
        radio_port: u8,
        mycall: &str,
    ) -> Result<Self, AgwpeError> {
        log::info!("[AGWPE] Connecting to Direwolf at {host}:{port}");
        let stream = TcpStream::connect((host, port)).await?;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[AGWPE] set_nodelay failed: {e}");
        }
        Self::start(stream, radio_port, mycall).await
    }

    /// Run the handshake over an established stream and spawn the I/O tasks.
    pub async fn start<S>(stream: S, radio_port: u8, mycall: &str) -> Result<Self, AgwpeError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let mut decoder = AgwFrameDecoder::new();
        let mut pending = VecDeque::new();

        write_half
            .write_all(&AgwFrame::version_request().encode())
            .await?;
        let version = tokio::time::timeout(
            ENGINE_READY_TIMEOUT,
            await_frame(&mut read_half, &mut decoder, &mut pending, kind::VERSION),
        )
        .await
        .map_err(|_| AgwpeError::Timeout("Direwolf version reply"))??;

        if version.data.len() >= 6 {
            let major = u16::from_le_bytes([version.data[0], version.data[1]]);
            let minor = u16::from_le_bytes([version.data[4], version.data[5]]);
            log::info!("[AGWPE] Direwolf ready (AGWPE version {major}.{minor})");
        } else {
            log::info!("[AGWPE] Direwolf ready");
        }

        write_half
            .write_all(&AgwFrame::register(mycall).encode())
            .await?;
        let reply = tokio::time::timeout(
            REGISTER_TIMEOUT,
            await_frame(&mut read_half, &mut decoder, &mut pending, kind::REGISTER),
        )
        .await
        .map_err(|_| AgwpeError::Timeout("callsign registration"))??;

        if reply.data.first() != Some(&1) {
            return Err(AgwpeError::RegistrationRefused(mycall.to_string()));
        }
        log::info!("[AGWPE] Registered {mycall} on radio port {radio_port}");

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let links: LinkTable = Arc::new(Mutex::new(HashMap::new()));

        let router = Router {
            links: Arc::clone(&links),
            incoming_tx,
            frame_tx: frame_tx.clone(),
            radio_port,
            mycall: mycall.to_string(),
        };
        let read_handle = tokio::spawn(read_loop(read_half, decoder, pending, router));
        let write_handle = tokio::spawn(write_loop(write_half, frame_rx));

        Ok(Self {
            mycall: mycall.to_string(),
            radio_port,
            frame_tx,
            incoming_rx,
            links,
            read_handle,
            write_handle,
        })
    }

    /// Number of stations currently linked.
    pub fn link_count(&self) -> usize {
        lock_links(&self.links).len()
    }
}

impl Drop for AgwpeAcceptor {
    fn drop(&mut self) {
        self.read_handle.abort();
        self.write_handle.abort();
    }
}

#[async_trait]
impl Acceptor for AgwpeAcceptor {
    async fn accept(&mut self) -> Result<Option<Incoming>, TransportError> {
        Ok(self.incoming_rx.recv().await)
    }

    /// Disconnect remaining stations, unregister, and close the socket.
    async fn shutdown(&mut self) {
        let remaining: Vec<(String, LinkEntry)> = lock_links(&self.links).drain().collect();
        for (remote, entry) in remaining {
            if !entry.closed.swap(true, Ordering::AcqRel) {
                log::info!("[AGWPE] Disconnecting {remote}");
                let frame = AgwFrame::disconnect(self.radio_port, &self.mycall, &remote);
                let _ = self.frame_tx.send(WriterMsg::Frame(frame.encode()));
            }
        }

        let _ = self
            .frame_tx
            .send(WriterMsg::Frame(AgwFrame::unregister(&self.mycall).encode()));

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.frame_tx.send(WriterMsg::Flush(ack_tx)).is_ok()
            && tokio::time::timeout(FLUSH_TIMEOUT, ack_rx).await.is_err()
        {
            log::warn!("[AGWPE] Timed out flushing frames to Direwolf");
        }

        self.read_handle.abort();
        log::info!("[AGWPE] Unregistered {}", self.mycall);
    }
}

/// Read frames until one of kind `want` arrives, keeping any that follow it.
async fn await_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut AgwFrameDecoder,
    pending: &mut VecDeque<AgwFrame>,
    want: u8,
) -> Result<AgwFrame, AgwpeError> {
    let mut buf = [0u8; 4096];
    loop {
        while let Some(frame) = pending.pop_front() {
            if frame.kind == want {
                return Ok(frame);
            }
            log::debug!(
                "[AGWPE] Ignoring '{}' frame during startup",
                char::from(frame.kind)
            );
        }

        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(AgwpeError::Disconnected);
        }
        pending.extend(decoder.feed(&buf[..n])?);
    }
}

/// Routing state shared by every frame the read task dispatches.
///
/// Kept apart from the socket half so dispatching never borrows the reader.
struct Router {
    links: LinkTable,
    incoming_tx: UnboundedSender<Incoming>,
    frame_tx: UnboundedSender<WriterMsg>,
    radio_port: u8,
    mycall: String,
}

impl Router {
    async fn dispatch(&self, frame: AgwFrame) {
        match frame.kind {
            kind::CONNECTED => self.on_connected(frame),
            kind::DATA => {
                let tx = lock_links(&self.links)
                    .get(&frame.call_from)
                    .map(|entry| entry.tx.clone());
                let Some(tx) = tx else {
                    log::debug!("[AGWPE] Data from unlinked station {}", frame.call_from);
                    return;
                };
                if tx.send(Bytes::from(frame.data)).await.is_err() {
                    // Session already gone; forget the link
                    lock_links(&self.links).remove(&frame.call_from);
                }
            }
            kind::DISCONNECT => {
                if let Some(entry) = lock_links(&self.links).remove(&frame.call_from) {
                    entry.closed.store(true, Ordering::Release);
                    log::info!("[AGWPE] {} disconnected", frame.call_from);
                }
            }
            other => {
                log::debug!("[AGWPE] Ignoring '{}' frame", char::from(other));
            }
        }
    }

    fn on_connected(&self, frame: AgwFrame) {
        if !frame.is_incoming_connect() {
            log::debug!("[AGWPE] Ignoring outgoing connect notice for {}", frame.call_from);
            return;
        }

        let remote = frame.call_from;
        if frame.port != self.radio_port {
            log::warn!(
                "[AGWPE] {} connected on radio port {}, expected {}; disconnecting",
                remote,
                frame.port,
                self.radio_port
            );
            let reject = AgwFrame::disconnect(frame.port, &self.mycall, &remote);
            let _ = self.frame_tx.send(WriterMsg::Frame(reject.encode()));
            return;
        }

        log::info!("[AGWPE] {} connected", remote);
        let (tx, rx) = mpsc::channel(AGW_LINK_QUEUE);
        let closed = Arc::new(AtomicBool::new(false));

        let previous = lock_links(&self.links).insert(
            remote.clone(),
            LinkEntry {
                tx,
                closed: Arc::clone(&closed),
            },
        );

        // Direwolf keeps one link per station pair, so a fresh connect means
        // the old link is already gone. Its writer must not send `d` for
        // the pair the new link now owns.
        let supersedes = previous.is_some();
        if let Some(previous) = previous {
            previous.closed.store(true, Ordering::Release);
            log::info!("[AGWPE] {} reconnected, previous link is gone", remote);
        }

        let incoming = Incoming {
            identity: remote.clone(),
            supersedes,
            reader: Box::new(AgwLinkReader { rx }),
            writer: Box::new(AgwLinkWriter {
                port: frame.port,
                mycall: self.mycall.clone(),
                remote,
                frame_tx: self.frame_tx.clone(),
                closed,
            }),
        };
        let _ = self.incoming_tx.send(incoming);
    }

    /// End every link; called when the engine connection is lost.
    fn close_all(&self) {
        for (_, entry) in lock_links(&self.links).drain() {
            entry.closed.store(true, Ordering::Release);
        }
    }
}

/// Read loop - decodes frames from Direwolf and routes them to links.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    mut decoder: AgwFrameDecoder,
    backlog: VecDeque<AgwFrame>,
    router: Router,
) {
    let mut buf = [0u8; 16 * 1024];
    for frame in backlog {
        router.dispatch(frame).await;
    }

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                log::error!("[AGWPE] Direwolf closed the connection");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                log::error!("[AGWPE] Read error: {e}");
                break;
            }
        };

        match decoder.feed(&buf[..n]) {
            Ok(frames) => {
                for frame in frames {
                    router.dispatch(frame).await;
                }
            }
            Err(e) => {
                log::error!("[AGWPE] Frame decode error: {e}");
                break;
            }
        }
    }

    router.close_all();
}

/// Write loop - writes encoded frames to Direwolf in order.
async fn write_loop<S: AsyncWrite>(
    mut writer: WriteHalf<S>,
    mut frame_rx: UnboundedReceiver<WriterMsg>,
) {
    while let Some(msg) = frame_rx.recv().await {
        match msg {
            WriterMsg::Frame(data) => {
                if let Err(e) = writer.write_all(&data).await {
                    log::error!("[AGWPE] Write error: {e}");
                    break;
                }
            }
            WriterMsg::Flush(ack) => {
                let _ = writer.flush().await;
                let _ = writer.shutdown().await;
                let _ = ack.send(());
                break;
            }
        }
    }
}

/// Receiving half of one station's link.
struct AgwLinkReader {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl LinkReader for AgwLinkReader {
    async fn read(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// Sending half of one station's link.
struct AgwLinkWriter {
    port: u8,
    mycall: String,
    remote: String,
    frame_tx: UnboundedSender<WriterMsg>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl LinkWriter for AgwLinkWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        for chunk in data.chunks(PACLEN) {
            let frame = AgwFrame::data(self.port, &self.mycall, &self.remote, chunk);
            self.frame_tx
                .send(WriterMsg::Frame(frame.encode()))
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let frame = AgwFrame::disconnect(self.port, &self.mycall, &self.remote);
        let _ = self.frame_tx.send(WriterMsg::Frame(frame.encode()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agwpe::frame::PID_NO_LAYER3;
    use crate::config::Config;
    use crate::relay::{Relay, RelaySettings};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    /// Scripted stand-in for Direwolf on the far end of a duplex pipe.
    struct FakeEngine {
        stream: DuplexStream,
        decoder: AgwFrameDecoder,
        pending: VecDeque<AgwFrame>,
    }

    impl FakeEngine {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                decoder: AgwFrameDecoder::new(),
                pending: VecDeque::new(),
            }
        }

        async fn next_frame(&mut self) -> Option<AgwFrame> {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(frame) = self.pending.pop_front() {
                    return Some(frame);
                }
                let n = self.stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return None;
                }
                self.pending.extend(self.decoder.feed(&buf[..n]).unwrap());
            }
        }

        async fn send(&mut self, frame: AgwFrame) {
            self.stream.write_all(&frame.encode()).await.unwrap();
        }

        async fn handshake(&mut self, accept: bool) {
            let probe = self.next_frame().await.unwrap();
            assert_eq!(probe.kind, kind::VERSION);
            let mut reply = AgwFrame::version_request();
            reply.data = vec![2, 0, 0, 0, 17, 0, 0, 0];
            self.send(reply).await;

            let register = self.next_frame().await.unwrap();
            assert_eq!(register.kind, kind::REGISTER);
            assert_eq!(register.call_from, "FOX-1");
            let mut reply = AgwFrame::register("FOX-1");
            reply.data = vec![u8::from(accept)];
            self.send(reply).await;
        }

        async fn connect_station(&mut self, port: u8, call: &str) {
            let mut frame = AgwFrame::disconnect(port, call, "FOX-1");
            frame.kind = kind::CONNECTED;
            frame.data = format!("*** CONNECTED With Station {call}\r").into_bytes();
            self.send(frame).await;
        }
    }

    /// Collect text sent to `call` until `needle` shows up. A disconnect
    /// for `call` fails the test.
    async fn read_text_until(engine: &mut FakeEngine, call: &str, needle: &str) -> String {
        let mut seen = Vec::new();
        while !String::from_utf8_lossy(&seen).contains(needle) {
            let frame = tokio::time::timeout(Duration::from_secs(5), engine.next_frame())
                .await
                .expect("timed out waiting for output")
                .expect("engine link closed");
            if frame.call_to != call {
                continue;
            }
            assert_ne!(frame.kind, kind::DISCONNECT, "{call} was disconnected");
            if frame.kind == kind::DATA {
                seen.extend_from_slice(&frame.data);
            }
        }
        String::from_utf8_lossy(&seen).into_owned()
    }

    async fn started() -> (AgwpeAcceptor, FakeEngine) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut engine = FakeEngine::new(server);
        let (acceptor, ()) = tokio::join!(
            AgwpeAcceptor::start(client, 0, "FOX-1"),
            engine.handshake(true)
        );
        (acceptor.unwrap(), engine)
    }

    #[tokio::test]
    async fn test_registration_refused() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut engine = FakeEngine::new(server);
        let (result, ()) = tokio::join!(
            AgwpeAcceptor::start(client, 0, "FOX-1"),
            engine.handshake(false)
        );
        assert!(matches!(result, Err(AgwpeError::RegistrationRefused(_))));
    }

    #[tokio::test]
    async fn test_engine_gone_during_startup() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        drop(server);
        assert!(AgwpeAcceptor::start(client, 0, "FOX-1").await.is_err());
    }

    #[tokio::test]
    async fn test_incoming_station_round_trip() {
        let (mut acceptor, mut engine) = started().await;

        engine.connect_station(0, "W1ABC").await;
        let mut incoming = acceptor.accept().await.unwrap().unwrap();
        assert_eq!(incoming.identity, "W1ABC");
        assert_eq!(acceptor.link_count(), 1);

        engine.send(AgwFrame::data(0, "W1ABC", "FOX-1", b"hello\r")).await;
        let chunk = incoming.reader.read().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello\r");

        // Outbound data is split at PACLEN
        let payload = vec![b'x'; PACLEN + 44];
        incoming.writer.write(&payload).await.unwrap();
        let first = engine.next_frame().await.unwrap();
        let second = engine.next_frame().await.unwrap();
        assert_eq!(first.kind, kind::DATA);
        assert_eq!(first.pid, PID_NO_LAYER3);
        assert_eq!(first.call_from, "FOX-1");
        assert_eq!(first.call_to, "W1ABC");
        assert_eq!(first.data.len(), PACLEN);
        assert_eq!(second.data.len(), 44);

        engine.send(AgwFrame::disconnect(0, "W1ABC", "FOX-1")).await;
        assert!(incoming.reader.read().await.unwrap().is_none());
        assert!(matches!(
            incoming.writer.write(b"late").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_writer_close_sends_single_disconnect() {
        let (mut acceptor, mut engine) = started().await;
        engine.connect_station(0, "K2XYZ").await;
        let mut incoming = acceptor.accept().await.unwrap().unwrap();

        incoming.writer.close().await;
        incoming.writer.close().await;
        incoming.writer.write(b"marker").await.unwrap_err();

        let frame = engine.next_frame().await.unwrap();
        assert_eq!(frame.kind, kind::DISCONNECT);
        assert_eq!(frame.call_from, "FOX-1");
        assert_eq!(frame.call_to, "K2XYZ");

        // Shutdown must not repeat the disconnect for an already closed link
        acceptor.shutdown().await;
        let next = engine.next_frame().await.unwrap();
        assert_eq!(next.kind, kind::UNREGISTER);
    }

    #[tokio::test]
    async fn test_outgoing_connect_and_stray_data_ignored() {
        let (mut acceptor, mut engine) = started().await;

        let mut outgoing = AgwFrame::disconnect(0, "N0CALL", "FOX-1");
        outgoing.kind = kind::CONNECTED;
        outgoing.data = b"*** CONNECTED To Station N0CALL\r".to_vec();
        engine.send(outgoing).await;
        engine.send(AgwFrame::data(0, "N0CALL", "FOX-1", b"who?\r")).await;

        engine.connect_station(0, "W1ABC").await;
        let incoming = acceptor.accept().await.unwrap().unwrap();
        assert_eq!(incoming.identity, "W1ABC");
        assert_eq!(acceptor.link_count(), 1);
    }

    #[tokio::test]
    async fn test_wrong_radio_port_rejected() {
        let (mut acceptor, mut engine) = started().await;

        engine.connect_station(1, "W1ABC").await;
        let reject = engine.next_frame().await.unwrap();
        assert_eq!(reject.kind, kind::DISCONNECT);
        assert_eq!(reject.port, 1);
        assert_eq!(reject.call_to, "W1ABC");

        engine.connect_station(0, "K2XYZ").await;
        let incoming = acceptor.accept().await.unwrap().unwrap();
        assert_eq!(incoming.identity, "K2XYZ");
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_and_unregisters() {
        let (mut acceptor, mut engine) = started().await;
        engine.connect_station(0, "W1ABC").await;
        let _incoming = acceptor.accept().await.unwrap().unwrap();

        acceptor.shutdown().await;

        let disconnect = engine.next_frame().await.unwrap();
        assert_eq!(disconnect.kind, kind::DISCONNECT);
        assert_eq!(disconnect.call_to, "W1ABC");
        let unregister = engine.next_frame().await.unwrap();
        assert_eq!(unregister.kind, kind::UNREGISTER);
        assert_eq!(unregister.call_from, "FOX-1");
        assert!(engine.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_old_link() {
        let (mut acceptor, mut engine) = started().await;

        engine.connect_station(0, "W1ABC").await;
        let mut first = acceptor.accept().await.unwrap().unwrap();
        assert!(!first.supersedes);

        engine.connect_station(0, "W1ABC").await;
        let mut second = acceptor.accept().await.unwrap().unwrap();
        assert!(second.supersedes);
        assert_eq!(acceptor.link_count(), 1);

        // The old link is dead and must not disconnect the new one
        assert!(first.reader.read().await.unwrap().is_none());
        first.writer.close().await;
        assert!(first.writer.write(b"stale").await.is_err());

        second.writer.write(b"still here").await.unwrap();
        let frame = engine.next_frame().await.unwrap();
        assert_eq!(frame.kind, kind::DATA);
        assert_eq!(frame.data, b"still here");

        engine.send(AgwFrame::data(0, "W1ABC", "FOX-1", b"again\r")).await;
        let chunk = second.reader.read().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"again\r");

        acceptor.shutdown().await;
        let disconnect = engine.next_frame().await.unwrap();
        assert_eq!(disconnect.kind, kind::DISCONNECT);
        assert_eq!(disconnect.call_to, "W1ABC");
        let unregister = engine.next_frame().await.unwrap();
        assert_eq!(unregister.kind, kind::UNREGISTER);
    }

    #[tokio::test]
    async fn test_relay_admits_reconnecting_station() {
        let (acceptor, mut engine) = started().await;
        // Default policy refuses duplicates from other transports
        let relay = Relay::new(RelaySettings::from(&Config::new("FOX-1")));
        let registry = relay.registry();
        let token = relay.shutdown_token();
        let handle = tokio::spawn(relay.run(acceptor));

        engine.connect_station(0, "W1ABC").await;
        let greeting = read_text_until(&mut engine, "W1ABC", "W1ABC> ").await;
        assert_eq!(greeting, "Welcome to FOX-1\r\nW1ABC> ");
        let first_serial = registry.get("W1ABC").unwrap().serial();

        engine.connect_station(0, "W1ABC").await;
        let greeting = read_text_until(&mut engine, "W1ABC", "W1ABC> ").await;
        assert_eq!(greeting, "Welcome to FOX-1\r\nW1ABC> ");
        let second_serial = registry.get("W1ABC").unwrap().serial();
        assert!(second_serial > first_serial);
        assert_eq!(registry.len(), 1);

        engine.send(AgwFrame::data(0, "W1ABC", "FOX-1", b"hi\r\n")).await;
        let echoed = read_text_until(&mut engine, "W1ABC", "W1ABC: hi\r\nW1ABC> ").await;
        assert!(echoed.starts_with("\r\n["));
        assert_eq!(registry.get("W1ABC").unwrap().serial(), second_serial);
        assert_eq!(registry.store().len(), 1);

        token.cancel();
        handle.await.unwrap().unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_lost_engine_ends_links_and_accept() {
        let (mut acceptor, mut engine) = started().await;
        engine.connect_station(0, "W1ABC").await;
        let mut incoming = acceptor.accept().await.unwrap().unwrap();

        drop(engine);

        assert!(incoming.reader.read().await.unwrap().is_none());
        assert!(acceptor.accept().await.unwrap().is_none());
    }
}
