//! wiremq-client - Async MQTT 3.1.1 client library.
//!
//! Connects over TCP, TLS, or WebSocket, with QoS 0/1/2 delivery,
//! automatic reconnection with exponential backoff, offline publish
//! queueing, and session replay (resubscribe + in-flight retransmission)
//! after a reconnect.
//!
//! # Example
//!
//! ```ignore
//! use tokio::sync::mpsc;
//! use wiremq_client::{AsyncClient, ClientConfig, QoS};
//!
//! let config = ClientConfig::from_uri("mqtt://localhost:1883")?
//!     .client_id("my-client");
//!
//! let (events_tx, mut events) = mpsc::channel(64);
//! let (client, event_loop) = AsyncClient::new(config, events_tx);
//! tokio::spawn(event_loop.run());
//!
//! client.connect().await?;
//! client.subscribe("sensors/#", QoS::AtLeastOnce).await?;
//! client.publish("sensors/temp", b"25.5", QoS::AtMostOnce, false).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```
//!
//! # Multiple clients with callbacks
//!
//! The [`Registry`] manages any number of clients behind opaque handles
//! and dispatches their events to registered callbacks:
//!
//! ```ignore
//! use wiremq_client::{EventKind, Registry};
//!
//! let registry = Registry::new();
//! let handle = registry.create_client_from_uri("mqtts://broker.example.com")?;
//! registry.on(handle, EventKind::Message, |event| println!("{event:?}"))?;
//! registry.connect(handle).await?;
//! ```

mod client;
mod config;
mod error;
mod events;
mod packet_id;
mod registry;
mod session;
mod transport;

pub use client::{AsyncClient, EventLoop};
pub use config::{BackoffConfig, ClientConfig, TlsConfig, TransportKind};
pub use error::{ClientError, Result};
pub use events::{ClientEvent, EventKind};
pub use registry::{ClientHandle, Notification, Registry};

// Re-export useful types from core
pub use wiremq_core::packet::{Publish, QoS};
