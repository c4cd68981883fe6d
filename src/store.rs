//! Bounded in-memory chat history.
//!
//! When the store is full, appending a new message silently evicts the
//! oldest one. History is never persisted and never aged out at read time;
//! capacity is the only retention policy.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Local};

/// Default number of retained messages.
pub const DEFAULT_MAX_MESSAGES: usize = 15;

/// A posted chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    origin: String,
    timestamp: DateTime<Local>,
    text: String,
}

impl Message {
    /// Create a message stamped with the current local time.
    pub fn new(origin: impl Into<String>, text: impl Into<String>) -> Self {
        Self::with_timestamp(origin, text, Local::now())
    }

    /// Create a message with an explicit timestamp.
    pub fn with_timestamp(
        origin: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Local>,
    ) -> Self {
        Self {
            origin: origin.into(),
            timestamp,
            text: text.into(),
        }
    }

    /// Identity of the session that posted the message.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// When the message was posted.
    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// Message body.
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl std::fmt::Display for Message {
    /// `[HH:MM] origin: text`
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.timestamp.format("%H:%M"),
            self.origin,
            self.text
        )
    }
}

/// Thread-safe, fixed-capacity message history (oldest first).
#[derive(Debug)]
pub struct MessageStore {
    messages: Mutex<VecDeque<Message>>,
    capacity: usize,
}

impl MessageStore {
    /// Create a store retaining at most `capacity` messages.
    ///
    /// A capacity of zero keeps no history at all.
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Append a message, evicting the oldest if the store is full.
    pub fn append(&self, message: Message) {
        if self.capacity == 0 {
            return;
        }
        let mut messages = self.lock();
        while messages.len() >= self.capacity {
            messages.pop_front();
        }
        messages.push_back(message);
    }

    /// Copy of the history at a single point in time, oldest first.
    pub fn snapshot(&self) -> Vec<Message> {
        self.lock().iter().cloned().collect()
    }

    /// Number of retained messages.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if no messages are retained.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Configured maximum number of messages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Message>> {
        // A panic while holding the lock cannot leave the deque half-updated
        self.messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES)
    }
}
