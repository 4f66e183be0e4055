//! Multi-client registry and event dispatch.
//!
//! Owns every client in the process, keyed by an opaque handle. Each
//! client's events flow through one shared fan-out channel; a dispatcher
//! task routes them to the callbacks registered for that handle. Events
//! that race a removed client are dropped, never an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use wiremq_core::QoS;

use crate::client::AsyncClient;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, EventKind};

/// Opaque identifier for a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(u64);

/// An event tagged with the client it came from.
#[derive(Debug, Clone)]
pub struct Notification {
    pub handle: ClientHandle,
    pub event: ClientEvent,
}

type Callback = Arc<dyn Fn(&ClientEvent) + Send + Sync>;
type CallbackMap = Arc<Mutex<HashMap<EventKind, Callback>>>;

struct Entry {
    client: AsyncClient,
    task: JoinHandle<()>,
    forwarder: JoinHandle<()>,
    callbacks: CallbackMap,
}

type ClientMap = Arc<Mutex<HashMap<ClientHandle, Entry>>>;

/// Registry of clients with callback-style event delivery.
///
/// Must be created inside a tokio runtime; it spawns the dispatcher task
/// immediately and one event-loop task per client.
pub struct Registry {
    clients: ClientMap,
    notify_tx: mpsc::Sender<Notification>,
    dispatcher: JoinHandle<()>,
    next_handle: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        let clients: ClientMap = Arc::new(Mutex::new(HashMap::new()));
        let (notify_tx, mut notify_rx) = mpsc::channel::<Notification>(256);
        let dispatch_map = Arc::clone(&clients);
        let dispatcher = tokio::spawn(async move {
            while let Some(note) = notify_rx.recv().await {
                dispatch(&dispatch_map, &note);
            }
        });
        Self {
            clients,
            notify_tx,
            dispatcher,
            next_handle: AtomicU64::new(1),
        }
    }

    /// Create a client and start its event loop. The client stays
    /// disconnected until `connect` is called on its handle.
    pub fn create_client(&self, config: ClientConfig) -> ClientHandle {
        let handle = ClientHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));

        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (client, event_loop) = AsyncClient::new(config, events_tx);
        let task = tokio::spawn(event_loop.run());

        let notify_tx = self.notify_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if notify_tx.send(Notification { handle, event }).await.is_err() {
                    break;
                }
            }
        });

        self.clients.lock().insert(
            handle,
            Entry {
                client,
                task,
                forwarder,
                callbacks: Arc::new(Mutex::new(HashMap::new())),
            },
        );
        log::debug!("created client {handle:?}");
        handle
    }

    /// Create a client from a broker URI (`mqtt`, `mqtts`, `ws`, `wss`).
    pub fn create_client_from_uri(&self, uri: &str) -> Result<ClientHandle> {
        Ok(self.create_client(ClientConfig::from_uri(uri)?))
    }

    /// Stop a client and forget its handle. Resolves only after the event
    /// loop has closed its transport and exited.
    pub async fn remove_client(&self, handle: ClientHandle) -> Result<()> {
        let entry = self
            .clients
            .lock()
            .remove(&handle)
            .ok_or(ClientError::UnknownHandle)?;
        let _ = entry.client.shutdown().await;
        let _ = entry.task.await;
        let _ = entry.forwarder.await;
        log::debug!("removed client {handle:?}");
        Ok(())
    }

    /// Register a callback for one event kind. Registering again for the
    /// same kind replaces the previous callback.
    pub fn on<F>(&self, handle: ClientHandle, kind: EventKind, callback: F) -> Result<()>
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let clients = self.clients.lock();
        let entry = clients.get(&handle).ok_or(ClientError::UnknownHandle)?;
        entry.callbacks.lock().insert(kind, Arc::new(callback));
        Ok(())
    }

    pub async fn connect(&self, handle: ClientHandle) -> Result<()> {
        self.client(handle)?.connect().await
    }

    pub async fn reconnect(&self, handle: ClientHandle) -> Result<()> {
        self.client(handle)?.reconnect().await
    }

    pub async fn disconnect(&self, handle: ClientHandle) -> Result<()> {
        self.client(handle)?.disconnect().await
    }

    pub async fn subscribe(&self, handle: ClientHandle, filter: &str, qos: QoS) -> Result<()> {
        self.client(handle)?.subscribe(filter, qos).await
    }

    pub async fn unsubscribe(&self, handle: ClientHandle, filter: &str) -> Result<()> {
        self.client(handle)?.unsubscribe(filter).await
    }

    pub async fn publish(
        &self,
        handle: ClientHandle,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        self.client(handle)?.publish(topic, payload, qos, retain).await
    }

    pub async fn is_connected(&self, handle: ClientHandle) -> Result<bool> {
        self.client(handle)?.is_connected().await
    }

    fn client(&self, handle: ClientHandle) -> Result<AsyncClient> {
        self.clients
            .lock()
            .get(&handle)
            .map(|entry| entry.client.clone())
            .ok_or(ClientError::UnknownHandle)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

fn dispatch(clients: &ClientMap, note: &Notification) {
    let callbacks = match clients.lock().get(&note.handle) {
        Some(entry) => Arc::clone(&entry.callbacks),
        None => {
            log::debug!("dropping event for unknown client {:?}", note.handle);
            return;
        }
    };
    // Invoke outside both locks so a callback may call back into the
    // registry, including re-registering its own handler.
    let callback = callbacks.lock().get(&note.event.kind()).cloned();
    if let Some(callback) = callback {
        callback(&note.event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> ClientConfig {
        ClientConfig::new("localhost", 1883).auto_reconnect(false)
    }

    #[test]
    fn dispatch_to_unknown_handle_is_dropped() {
        let clients: ClientMap = Arc::new(Mutex::new(HashMap::new()));
        dispatch(
            &clients,
            &Notification {
                handle: ClientHandle(42),
                event: ClientEvent::Connected {
                    session_present: false,
                },
            },
        );
    }

    #[tokio::test]
    async fn callback_is_invoked_and_replaced() {
        let registry = Registry::new();
        let handle = registry.create_client(config());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = tx.clone();
        registry
            .on(handle, EventKind::Connect, move |_| {
                let _ = first.send("first");
            })
            .unwrap();
        registry
            .on(handle, EventKind::Connect, move |_| {
                let _ = tx.send("second");
            })
            .unwrap();

        registry
            .notify_tx
            .send(Notification {
                handle,
                event: ClientEvent::Connected {
                    session_present: false,
                },
            })
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("callback fired")
            .unwrap();
        assert_eq!(got, "second");

        registry.remove_client(handle).await.unwrap();
    }

    #[tokio::test]
    async fn callback_may_reregister_from_inside() {
        let registry = Arc::new(Registry::new());
        let handle = registry.create_client(config());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let inner = Arc::clone(&registry);
        registry
            .on(handle, EventKind::Connect, move |_| {
                let replacement_tx = tx.clone();
                inner
                    .on(handle, EventKind::Connect, move |_| {
                        let _ = replacement_tx.send("replaced");
                    })
                    .unwrap();
            })
            .unwrap();

        let connected = || Notification {
            handle,
            event: ClientEvent::Connected {
                session_present: false,
            },
        };
        // First event installs the replacement, second one runs it.
        registry.notify_tx.send(connected()).await.unwrap();
        registry.notify_tx.send(connected()).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("replacement callback fired")
            .unwrap();
        assert_eq!(got, "replaced");

        registry.remove_client(handle).await.unwrap();
    }

    #[tokio::test]
    async fn removed_handle_is_unknown() {
        let registry = Registry::new();
        let handle = registry.create_client(config());
        registry.remove_client(handle).await.unwrap();

        assert!(matches!(
            registry.remove_client(handle).await,
            Err(ClientError::UnknownHandle)
        ));
        assert!(matches!(
            registry.is_connected(handle).await,
            Err(ClientError::UnknownHandle)
        ));
        assert!(matches!(
            registry.on(handle, EventKind::Message, |_| {}),
            Err(ClientError::UnknownHandle)
        ));
    }

    #[tokio::test]
    async fn create_from_uri_validates() {
        let registry = Registry::new();
        assert!(registry.create_client_from_uri("http://nope").is_err());

        let handle = registry
            .create_client_from_uri("mqtt://localhost:1883")
            .unwrap();
        assert!(!registry.is_connected(handle).await.unwrap());
        registry.remove_client(handle).await.unwrap();
    }
}
