//! Protocol error types.

use thiserror::Error;

/// Errors produced while encoding or decoding MQTT packets.
///
/// Any of these is fatal for the connection that produced the bytes. An
/// incomplete frame is not an error; the codec reports it as `Ok(None)`.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("remaining length exceeds 4 bytes")]
    InvalidRemainingLength,

    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("invalid QoS: {0}")]
    InvalidQos(u8),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
