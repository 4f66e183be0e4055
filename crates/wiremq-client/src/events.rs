//! Client events and connection phases.

use std::time::Duration;

use bytes::Bytes;

use wiremq_core::QoS;

/// Events emitted by a client's event loop.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connected to the broker.
    Connected {
        /// Whether a previous session was restored.
        session_present: bool,
    },
    /// Disconnected from the broker.
    Disconnected {
        /// Reason for the disconnection, if known.
        reason: Option<String>,
    },
    /// Received an application message.
    Message {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// A recoverable or terminal failure the caller should see.
    Error { reason: String },
    /// The broker granted a subscription.
    Subscribed { filter: String, qos: QoS },
    /// The broker acknowledged an unsubscribe.
    Unsubscribed { filter: String },
    /// About to attempt a reconnection (auto-reconnect only).
    Reconnecting {
        /// 1-based attempt counter.
        attempt: u32,
        /// Backoff delay before this attempt.
        delay: Duration,
    },
}

/// Event names for callback registration.
///
/// One callback per kind; registering again replaces the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Message,
    Error,
    Subscribed,
    Unsubscribed,
    Reconnecting,
}

impl ClientEvent {
    /// The kind used to look up a registered callback.
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::Connected { .. } => EventKind::Connect,
            ClientEvent::Disconnected { .. } => EventKind::Disconnect,
            ClientEvent::Message { .. } => EventKind::Message,
            ClientEvent::Error { .. } => EventKind::Error,
            ClientEvent::Subscribed { .. } => EventKind::Subscribed,
            ClientEvent::Unsubscribed { .. } => EventKind::Unsubscribed,
            ClientEvent::Reconnecting { .. } => EventKind::Reconnecting,
        }
    }
}
