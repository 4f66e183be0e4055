//! Client error types.

use std::io;

use thiserror::Error;

use wiremq_core::ProtocolError;

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Bad URI or options. Surfaced synchronously at client creation.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer sent a malformed frame. Fatal for the current connection.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection timeout")]
    ConnectionTimeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("TLS error: {0}")]
    Tls(String),

    /// A QoS 1/2 publish exhausted its retransmission budget.
    #[error("publish {packet_id} timed out after {retries} retries")]
    PublishTimeout { packet_id: u16, retries: u32 },

    /// The broker rejected a subscription (SUBACK 0x80).
    #[error("subscription rejected: {filter}")]
    SubscribeRejected { filter: String },

    /// The handle does not refer to a live client.
    #[error("unknown client handle")]
    UnknownHandle,
}

pub type Result<T> = std::result::Result<T, ClientError>;
