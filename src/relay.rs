//! Relay dispatcher.
//!
//! [`Relay::run`] owns the event loop. An accept task feeds new links in,
//! every session contributes a reader and a writer task, and all of them
//! report back through one [`RelayEvent`] channel. Only this loop
//! registers, posts, and removes, so history order and broadcast order are
//! the same total order.
//!
//! ```text
//! Acceptor ──► accept task ──┐
//!                            ├──► events ──► Relay::run ──► Registry ──► Outbound queues
//! read_loop (per session) ───┤                                             │
//! write_loop (per session) ──┘◄────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::constants::{DUPLICATE_NOTICE, DUPLICATE_NOTICE_TIMEOUT};
use crate::events::{CloseReason, RelayEvent};
use crate::framer::{encode_latin1, LineFramer};
use crate::registry::{DuplicatePolicy, Registration, Registry};
use crate::session::{read_loop, write_loop, Outbound};
use crate::store::MessageStore;
use crate::transport::{Acceptor, Incoming};

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How long shutdown waits for session tasks to close their links.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runtime knobs for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// Name shown in the banner.
    pub system_identity: String,
    /// History capacity; 0 keeps nothing.
    pub max_messages: usize,
    /// Longest unterminated line a station may send.
    pub max_line_bytes: usize,
    /// Bound on a single link write.
    pub write_timeout: Duration,
    /// Outbound chunks a session may have pending.
    pub outbound_queue_depth: usize,
    /// What to do with a second connection from a connected identity.
    pub duplicate_policy: DuplicatePolicy,
}

impl From<&Config> for RelaySettings {
    fn from(config: &Config) -> Self {
        Self {
            system_identity: config.callsign.clone(),
            max_messages: config.max_messages,
            max_line_bytes: config.max_line_bytes,
            write_timeout: config.write_timeout(),
            outbound_queue_depth: config.outbound_queue_depth,
            duplicate_policy: config.duplicate_policy,
        }
    }
}

/// Why the event loop stopped.
enum Stop<A> {
    Requested,
    AcceptorClosed(std::result::Result<A, tokio::task::JoinError>),
}

/// The message relay.
pub struct Relay {
    settings: RelaySettings,
    registry: Arc<Registry>,
    events_tx: UnboundedSender<RelayEvent>,
    events_rx: UnboundedReceiver<RelayEvent>,
    tasks: JoinSet<()>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("settings", &self.settings)
            .field("sessions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Build a relay with an empty registry and history.
    pub fn new(settings: RelaySettings) -> Self {
        let store = Arc::new(MessageStore::new(settings.max_messages));
        let registry = Arc::new(Registry::new(
            settings.system_identity.as_str(),
            store,
            settings.duplicate_policy,
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            settings,
            registry,
            events_tx,
            events_rx,
            tasks: JoinSet::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Shared registry (for inspection).
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Token that stops [`Relay::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve connections from `acceptor` until shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the acceptor stops producing connections on its
    /// own (for example, Direwolf went away).
    pub async fn run<A: Acceptor + 'static>(mut self, acceptor: A) -> Result<()> {
        log::info!("[Relay] {} is running", self.settings.system_identity);

        let mut accept_handle: JoinHandle<A> = tokio::spawn(accept_loop(
            acceptor,
            self.events_tx.clone(),
            self.shutdown.clone(),
        ));

        let stop = loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break Stop::Requested,
                joined = &mut accept_handle => break Stop::AcceptorClosed(joined),
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            log::error!("[Relay] Session task panicked: {e}");
                        }
                    }
                }
            }
        };

        self.shutdown.cancel();
        let closed = self.registry.close_all();
        log::info!("[Relay] Closed {closed} session(s)");

        if tokio::time::timeout(SESSION_DRAIN_TIMEOUT, self.drain_tasks())
            .await
            .is_err()
        {
            log::warn!("[Relay] Session tasks did not finish in time, aborting");
            self.tasks.abort_all();
        }

        let (joined, unexpected) = match stop {
            Stop::Requested => (accept_handle.await, false),
            Stop::AcceptorClosed(joined) => (joined, true),
        };

        match joined {
            Ok(mut acceptor) => acceptor.shutdown().await,
            Err(e) => log::error!("[Relay] Accept task failed: {e}"),
        }

        if unexpected {
            bail!("Acceptor closed");
        }
        log::info!("[Relay] Shutdown complete");
        Ok(())
    }

    async fn drain_tasks(&mut self) {
        while self.tasks.join_next().await.is_some() {}
    }

    fn handle_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Accepted(incoming) => self.handle_accepted(incoming),
            RelayEvent::Line {
                identity,
                serial,
                text,
            } => self.handle_line(&identity, serial, &text),
            RelayEvent::Closed {
                identity,
                serial,
                reason,
            } => self.handle_closed(&identity, serial, &reason),
        }
    }

    fn handle_accepted(&mut self, incoming: Incoming) {
        let Incoming {
            identity,
            supersedes,
            reader,
            mut writer,
        } = incoming;

        if supersedes {
            if let Some(old) = self.registry.remove(&identity) {
                log::info!(
                    "[Relay] {} (session #{}) {}",
                    identity,
                    old.serial(),
                    CloseReason::Replaced
                );
            }
        }

        let (outbound, outbound_rx) = Outbound::channel(self.settings.outbound_queue_depth);
        let Registration { session, replaced } = match self.registry.register(&identity, outbound) {
            Ok(registration) => registration,
            Err(e) => {
                log::warn!("[Relay] Refusing connection: {e}");
                drop(reader);
                self.tasks.spawn(async move {
                    let notice = encode_latin1(DUPLICATE_NOTICE);
                    match tokio::time::timeout(DUPLICATE_NOTICE_TIMEOUT, writer.write(&notice)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => log::debug!("[Relay] Refusal notice not delivered: {e}"),
                        Err(_) => log::debug!("[Relay] Refusal notice timed out"),
                    }
                    writer.close().await;
                });
                return;
            }
        };

        if let Some(old) = replaced {
            log::info!(
                "[Relay] {} (session #{}) {}",
                identity,
                old.serial(),
                CloseReason::Replaced
            );
        }

        let serial = session.serial();
        let cancel = session.cancel_token();

        self.tasks.spawn(write_loop(
            identity.clone(),
            serial,
            writer,
            outbound_rx,
            self.settings.write_timeout,
            self.events_tx.clone(),
            cancel.clone(),
        ));

        if !self.registry.greet(&session) {
            return;
        }

        self.tasks.spawn(read_loop(
            identity.clone(),
            serial,
            reader,
            LineFramer::new(self.settings.max_line_bytes),
            self.events_tx.clone(),
            cancel,
        ));

        log::info!(
            "[Relay] {} connected ({} online)",
            identity,
            self.registry.len()
        );
    }

    fn handle_line(&mut self, identity: &str, serial: u64, text: &str) {
        let current = self
            .registry
            .get(identity)
            .is_some_and(|s| s.serial() == serial && s.is_active());
        if !current {
            log::debug!("[Relay] Dropping line from stale session {identity} #{serial}");
            return;
        }

        if let Some(report) = self.registry.post(identity, text) {
            log::info!(
                "[Relay] {}: {} (delivered to {})",
                identity,
                text.trim(),
                report.delivered
            );
        }
    }

    fn handle_closed(&mut self, identity: &str, serial: u64, reason: &CloseReason) {
        if self.registry.remove_session(identity, serial).is_some() {
            log::info!(
                "[Relay] {} left: {} ({} online)",
                identity,
                reason,
                self.registry.len()
            );
        } else {
            log::debug!("[Relay] Ignoring close of stale session {identity} #{serial}: {reason}");
        }
    }
}

/// Accept loop - hands new links to the dispatcher and returns the acceptor
/// when it stops, so the caller can shut it down.
async fn accept_loop<A: Acceptor>(
    mut acceptor: A,
    events: UnboundedSender<RelayEvent>,
    shutdown: CancellationToken,
) -> A {
    loop {
        let result = tokio::select! {
            () = shutdown.cancelled() => break,
            result = acceptor.accept() => result,
        };

        match result {
            Ok(Some(incoming)) => {
                log::debug!("[Relay] Accepted link from {}", incoming.identity);
                if events.send(RelayEvent::Accepted(incoming)).is_err() {
                    log::warn!("[Relay] Event channel closed, stopping accept loop");
                    break;
                }
            }
            Ok(None) => {
                log::error!("[Relay] Acceptor closed");
                break;
            }
            Err(e) => {
                log::error!("[Relay] Accept error: {e}");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
    acceptor
}
