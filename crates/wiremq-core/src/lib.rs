//! wiremq-core - Core MQTT 3.1.1 types and wire codec.
//!
//! Packet structures and the streaming encode/decode routines shared by
//! anything that speaks the MQTT wire protocol. Decoding distinguishes an
//! incomplete frame (`Ok(None)`, caller buffers more bytes) from a malformed
//! frame (`Err`, fatal for the connection).

pub mod error;
pub mod packet;
pub mod varint;

pub use error::{ProtocolError, Result};
pub use packet::*;
