//! Manage several clients through the registry with callback dispatch.
//!
//! Usage: cargo run --example callback [broker-uri]

use std::time::Duration;

use wiremq_client::{EventKind, QoS, Registry, Result};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let uri = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "mqtt://localhost:1883".to_string());

    let registry = Registry::new();
    let subscriber = registry.create_client_from_uri(&uri)?;
    let publisher = registry.create_client_from_uri(&uri)?;

    registry.on(subscriber, EventKind::Message, |event| {
        println!("received: {event:?}");
    })?;
    registry.on(subscriber, EventKind::Reconnecting, |event| {
        println!("retrying: {event:?}");
    })?;

    registry.connect(subscriber).await?;
    registry.connect(publisher).await?;
    registry
        .subscribe(subscriber, "demo/#", QoS::AtLeastOnce)
        .await?;

    for n in 0..5 {
        let payload = format!("message {n}");
        registry
            .publish(publisher, "demo/counter", payload.as_bytes(), QoS::AtLeastOnce, false)
            .await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    registry.remove_client(publisher).await?;
    registry.remove_client(subscriber).await?;
    Ok(())
}
