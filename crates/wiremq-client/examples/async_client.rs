//! Subscribe and publish with a single client, consuming events directly.
//!
//! Usage: cargo run --example async_client [broker-uri]

use tokio::sync::mpsc;
use wiremq_client::{AsyncClient, ClientConfig, ClientEvent, QoS, Result};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let uri = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "mqtt://localhost:1883".to_string());
    let config = ClientConfig::from_uri(&uri)?.client_id("wiremq-example");

    let (events_tx, mut events) = mpsc::channel(64);
    let (client, event_loop) = AsyncClient::new(config, events_tx);
    tokio::spawn(event_loop.run());

    client.connect().await?;
    client.subscribe("demo/#", QoS::AtLeastOnce).await?;
    client
        .publish("demo/hello", b"hello from wiremq", QoS::AtLeastOnce, false)
        .await?;

    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Message {
                topic, payload, ..
            } => {
                println!("{topic}: {}", String::from_utf8_lossy(&payload));
            }
            ClientEvent::Disconnected { reason } => {
                println!("disconnected: {reason:?}");
            }
            other => println!("{other:?}"),
        }
    }
    Ok(())
}
