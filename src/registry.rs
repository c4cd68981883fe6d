//! Session registry and broadcaster.
//!
//! The registry is the sole owner of live-session membership. Posting a
//! message appends it to the [`MessageStore`] and fans the formatted line
//! out to every active session, each followed by that session's own
//! prompt.
//!
//! # Locking
//!
//! The session map and the message store each have their own mutex.
//! [`Registry::publish`] takes the store lock to append, releases it, then
//! takes the map lock just long enough to clone a snapshot of sessions.
//! Queueing to recipients happens with no lock held. Nothing acquires the
//! two locks nested.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::framer::encode_latin1;
use crate::session::{format_broadcast, Outbound, Session};
use crate::store::{Message, MessageStore};

/// What to do when an identity connects while already connected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Reject the new connection.
    #[default]
    Refuse,
    /// Close the existing session and accept the new one.
    Replace,
}

/// Registration conflict: the identity already has an active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateIdentityError {
    /// The conflicting identity.
    pub identity: String,
}

impl std::fmt::Display for DuplicateIdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity already connected: {}", self.identity)
    }
}

impl std::error::Error for DuplicateIdentityError {}

/// Result of a successful registration.
#[derive(Debug)]
pub struct Registration {
    /// The new session.
    pub session: Arc<Session>,
    /// Session evicted under [`DuplicatePolicy::Replace`], already closed.
    pub replaced: Option<Arc<Session>>,
}

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions the line was queued to.
    pub delivered: usize,
    /// Sessions that failed and were closed.
    pub dropped: Vec<String>,
}

/// Thread-safe set of live sessions plus the shared message history.
#[derive(Debug)]
pub struct Registry {
    system_identity: String,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    store: Arc<MessageStore>,
    policy: DuplicatePolicy,
    next_serial: AtomicU64,
    shutdown: CancellationToken,
}

impl Registry {
    /// Create an empty registry.
    pub fn new(
        system_identity: impl Into<String>,
        store: Arc<MessageStore>,
        policy: DuplicatePolicy,
    ) -> Self {
        Self {
            system_identity: system_identity.into(),
            sessions: Mutex::new(HashMap::new()),
            store,
            policy,
            next_serial: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// The relay's own identity, shown in the banner.
    pub fn system_identity(&self) -> &str {
        &self.system_identity
    }

    /// Shared message history.
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Add a session for `identity` writing to `sink`.
    ///
    /// The session starts in `Connecting`; call [`Registry::greet`] next.
    pub fn register(
        &self,
        identity: &str,
        sink: Outbound,
    ) -> Result<Registration, DuplicateIdentityError> {
        let mut sessions = self.lock_sessions();

        let existing_active = sessions.get(identity).map(|s| s.is_active());
        if existing_active == Some(true) && self.policy == DuplicatePolicy::Refuse {
            return Err(DuplicateIdentityError {
                identity: identity.to_string(),
            });
        }

        // Either replacing a live session or clearing one that is already
        // closing but not yet removed
        let replaced = sessions.remove(identity);
        if let Some(old) = &replaced {
            old.mark_closed();
            if existing_active == Some(true) {
                log::info!("[Relay] {} reconnected, closing previous session", identity);
            }
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(
            identity,
            serial,
            self.system_identity.as_str(),
            sink,
            self.shutdown.child_token(),
        ));
        sessions.insert(identity.to_string(), Arc::clone(&session));

        Ok(Registration { session, replaced })
    }

    /// Send banner, history and first prompt to a freshly registered
    /// session. A session that cannot take the handshake is removed.
    pub fn greet(&self, session: &Session) -> bool {
        let history = self.store.snapshot();
        match session.greet(&history) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[Relay] Handshake with {} failed: {e}", session.identity());
                self.remove_session(session.identity(), session.serial());
                false
            }
        }
    }

    /// Post a line from `from`. Blank text is ignored.
    pub fn post(&self, from: &str, text: &str) -> Option<BroadcastReport> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(self.publish(Message::new(from, text)))
    }

    /// Append `message` to history and deliver it to every active session.
    ///
    /// A failing recipient is closed and removed; delivery to the others
    /// continues.
    pub fn publish(&self, message: Message) -> BroadcastReport {
        let line = Bytes::from(encode_latin1(&format_broadcast(&message)));
        self.store.append(message);

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        for session in self.snapshot() {
            if !session.is_active() {
                continue;
            }
            match session.deliver(&line) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    log::warn!("[Relay] Dropping {}: {e}", session.identity());
                    session.begin_close();
                    failed.push(session);
                }
            }
        }

        for session in failed {
            self.remove_session(session.identity(), session.serial());
            report.dropped.push(session.identity().to_string());
        }

        report
    }

    /// Remove whatever session holds `identity`. No-op if absent.
    pub fn remove(&self, identity: &str) -> Option<Arc<Session>> {
        let removed = self.lock_sessions().remove(identity);
        if let Some(session) = &removed {
            session.mark_closed();
        }
        removed
    }

    /// Remove `identity` only if it is still the session with `serial`.
    ///
    /// Close events can arrive after the identity reconnected; those must
    /// not take down the newer session.
    pub fn remove_session(&self, identity: &str, serial: u64) -> Option<Arc<Session>> {
        let removed = {
            let mut sessions = self.lock_sessions();
            match sessions.get(identity) {
                Some(existing) if existing.serial() == serial => sessions.remove(identity),
                _ => None,
            }
        };
        if let Some(session) = &removed {
            session.mark_closed();
        }
        removed
    }

    /// Look up the live session for `identity`.
    pub fn get(&self, identity: &str) -> Option<Arc<Session>> {
        self.lock_sessions().get(identity).cloned()
    }

    /// True if `identity` is registered.
    pub fn contains(&self, identity: &str) -> bool {
        self.lock_sessions().contains_key(identity)
    }

    /// Copy of the current session set.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.lock_sessions().values().cloned().collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.lock_sessions().len()
    }

    /// True if no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.lock_sessions().is_empty()
    }

    /// Close every session and empty the registry.
    ///
    /// Cancels each session's token, which unblocks its pending read
    /// without waiting for input.
    pub fn close_all(&self) -> usize {
        self.shutdown.cancel();
        let drained: Vec<_> = self.lock_sessions().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.mark_closed();
        }
        drained.len()
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
