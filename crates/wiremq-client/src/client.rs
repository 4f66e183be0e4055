//! Async MQTT client: command handle + event loop.
//!
//! Split architecture: `AsyncClient` (cloneable, sends commands over a
//! channel) and `EventLoop` (owns the transport and all session state).
//! The event loop task is the single writer for its session, so packet-id
//! allocation, subscription-table changes and phase transitions are never
//! interleaved. Transport I/O is the only suspension point.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use wiremq_core::{
    decode_packet, encode_packet, Connack, ConnackCode, Connect, Packet, Publish, QoS, Subscribe,
    Unsubscribe,
};

use crate::config::{BackoffConfig, ClientConfig};
use crate::error::{ClientError, Result};
use crate::events::ClientEvent;
use crate::packet_id::PacketIdAllocator;
use crate::session::{InflightPublish, Phase, QueuedPublish, Resend, Session, SubackOutcome};
use crate::transport::Transport;

const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Length-prefixed wire fields carry a 16-bit length.
const MAX_FIELD_LEN: usize = u16::MAX as usize;

fn check_field_len(what: &str, len: usize) -> Result<()> {
    if len > MAX_FIELD_LEN {
        return Err(ClientError::Config(format!(
            "{what} exceeds {MAX_FIELD_LEN} bytes"
        )));
    }
    Ok(())
}

/// Commands sent from `AsyncClient` to the event loop.
pub enum Command {
    Connect {
        resp: oneshot::Sender<Result<()>>,
    },
    Reconnect,
    Disconnect {
        resp: oneshot::Sender<()>,
    },
    Subscribe {
        filter: String,
        qos: QoS,
        resp: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        filter: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        resp: oneshot::Sender<Result<()>>,
    },
    IsConnected {
        resp: oneshot::Sender<bool>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Cloneable command handle for one client.
#[derive(Clone)]
pub struct AsyncClient {
    tx: mpsc::Sender<Command>,
}

impl AsyncClient {
    /// Create a client/event-loop pair. Events are delivered on `events`.
    pub fn new(config: ClientConfig, events: mpsc::Sender<ClientEvent>) -> (Self, EventLoop) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx }, EventLoop::new(config, rx, events))
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Open the connection and complete the CONNECT/CONNACK handshake.
    pub async fn connect(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Connect { resp }).await?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Tear down any current connection and connect again.
    pub async fn reconnect(&self) -> Result<()> {
        self.send(Command::Reconnect).await
    }

    /// Cleanly disconnect, discarding in-flight exchanges.
    pub async fn disconnect(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Disconnect { resp }).await?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }

    /// Request a subscription. Granting is reported via `Subscribed`.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            filter: filter.to_string(),
            qos,
            resp,
        })
        .await?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Drop a subscription. Completion is reported via `Unsubscribed`.
    pub async fn unsubscribe(&self, filter: &str) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Unsubscribe {
            filter: filter.to_string(),
            resp,
        })
        .await?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Publish a message. While disconnected the message is queued and
    /// flushed after the next successful connect.
    pub async fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Publish {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            qos,
            retain,
            resp,
        })
        .await?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Whether the session is currently in the Connected phase.
    pub async fn is_connected(&self) -> Result<bool> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::IsConnected { resp }).await?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }

    /// Stop the event loop. Resolves only after the transport is closed.
    pub async fn shutdown(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Shutdown { resp }).await?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// Owns the transport and drives one session.
pub struct EventLoop {
    config: ClientConfig,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ClientEvent>,
    transport: Option<Transport>,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    session: Session,
    packet_ids: PacketIdAllocator,
    /// Last client-sent traffic. Keep-alive counts writes only; inbound
    /// traffic does not defer the next PINGREQ.
    last_write: Instant,
    last_ping: Instant,
    ping_outstanding: bool,
    reconnect_attempt: u32,
    reconnect_delay: Duration,
}

impl EventLoop {
    fn new(
        config: ClientConfig,
        commands: mpsc::Receiver<Command>,
        events: mpsc::Sender<ClientEvent>,
    ) -> Self {
        let session = Session::new(config.offline_queue_limit);
        let reconnect_delay = config.backoff.initial_delay;
        Self {
            config,
            commands,
            events,
            transport: None,
            read_buf: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            write_buf: Vec::with_capacity(DEFAULT_BUFFER_SIZE),
            session,
            packet_ids: PacketIdAllocator::new(),
            last_write: Instant::now(),
            last_ping: Instant::now(),
            ping_outstanding: false,
            reconnect_attempt: 0,
            reconnect_delay,
        }
    }

    /// Drive the session until shutdown. Spawn this as a task.
    pub async fn run(mut self) {
        loop {
            let flow = if self.session.phase == Phase::Reconnecting {
                self.reconnect_tick().await
            } else if self.transport.is_some() {
                self.drive().await
            } else {
                self.idle().await
            };
            if flow == Flow::Shutdown {
                break;
            }
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }

    /// Disconnected and not reconnecting: nothing to do but wait for a command.
    async fn idle(&mut self) -> Flow {
        match self.commands.recv().await {
            Some(cmd) => self.handle_command(cmd).await,
            None => Flow::Shutdown,
        }
    }

    /// One iteration while a transport is open: flush, parse, then wait.
    async fn drive(&mut self) -> Flow {
        let Some(transport) = self.transport.as_mut() else {
            return Flow::Continue;
        };
        if !self.write_buf.is_empty() {
            let buf = std::mem::take(&mut self.write_buf);
            if let Err(e) = transport.write_all(&buf).await {
                return self.on_transport_loss(format!("write failed: {e}")).await;
            }
            self.last_write = Instant::now();
        }

        // Handle one buffered frame per iteration so responses it queues
        // get flushed before we block on I/O again.
        match decode_packet(&self.read_buf) {
            Ok(Some((packet, used))) => {
                let _ = self.read_buf.split_to(used);
                self.handle_packet(packet).await;
                return Flow::Continue;
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!("malformed frame from broker: {e}");
                self.emit(ClientEvent::Error {
                    reason: format!("malformed frame: {e}"),
                })
                .await;
                return self.on_transport_loss(format!("malformed frame: {e}")).await;
            }
        }

        // The wakeup is deadline-based so steady inbound traffic cannot
        // starve the ping timer.
        let tick = if self.config.keep_alive > 0 && self.session.phase.is_connected() {
            let interval = Duration::from_secs(u64::from(self.config.keep_alive));
            let base = if self.ping_outstanding {
                self.last_ping
            } else {
                self.last_write
            };
            let until_ping = (base + interval).duration_since(Instant::now());
            self.config.retry_interval.min(until_ping)
        } else {
            self.config.retry_interval
        };

        enum Action {
            Read(std::io::Result<usize>),
            Command(Option<Command>),
            Tick,
        }

        let action = match self.transport.as_mut() {
            Some(transport) => tokio::select! {
                result = transport.read_buf(&mut self.read_buf) => Action::Read(result),
                cmd = self.commands.recv() => Action::Command(cmd),
                _ = tokio::time::sleep(tick) => Action::Tick,
            },
            None => return Flow::Continue,
        };

        match action {
            Action::Read(Ok(0)) => {
                self.on_transport_loss("connection closed by peer".to_string())
                    .await
            }
            Action::Read(Ok(_)) => Flow::Continue,
            Action::Read(Err(e)) => self.on_transport_loss(format!("read failed: {e}")).await,
            Action::Command(Some(cmd)) => self.handle_command(cmd).await,
            Action::Command(None) => Flow::Shutdown,
            Action::Tick => self.on_tick().await,
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Connect { resp } => {
                let result = match self.session.phase {
                    Phase::Disconnected => self.establish().await,
                    _ => Err(ClientError::InvalidState(
                        "already connected or connecting".to_string(),
                    )),
                };
                let _ = resp.send(result);
                Flow::Continue
            }
            Command::Reconnect => {
                self.teardown_transport().await;
                self.session.phase = Phase::Disconnected;
                if let Err(e) = self.establish().await {
                    log::warn!("reconnect failed: {e}");
                }
                Flow::Continue
            }
            Command::Disconnect { resp } => {
                self.do_disconnect().await;
                let _ = resp.send(());
                Flow::Continue
            }
            Command::Subscribe { filter, qos, resp } => {
                let _ = resp.send(self.do_subscribe(filter, qos));
                Flow::Continue
            }
            Command::Unsubscribe { filter, resp } => {
                let _ = resp.send(self.do_unsubscribe(filter));
                Flow::Continue
            }
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                resp,
            } => {
                let _ = resp.send(self.do_publish(topic, payload, qos, retain));
                Flow::Continue
            }
            Command::IsConnected { resp } => {
                let _ = resp.send(self.session.phase.is_connected());
                Flow::Continue
            }
            Command::Shutdown { resp } => {
                self.do_disconnect().await;
                let _ = resp.send(());
                Flow::Shutdown
            }
        }
    }

    // === Connection lifecycle ===

    /// User-initiated connect: failure is surfaced both on the command
    /// result and as an `error` event, and hands the session to the
    /// reconnection supervisor when auto-reconnect is enabled.
    async fn establish(&mut self) -> Result<()> {
        self.session.phase = Phase::Connecting;
        match self.try_connect().await {
            Ok(session_present) => {
                self.on_connected(session_present).await;
                Ok(())
            }
            Err(e) => {
                self.teardown_transport().await;
                self.session.phase = if self.config.auto_reconnect {
                    Phase::Reconnecting
                } else {
                    Phase::Disconnected
                };
                self.emit(ClientEvent::Error {
                    reason: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    /// Open the transport and complete CONNECT/CONNACK.
    async fn try_connect(&mut self) -> Result<bool> {
        check_field_len("client id", self.config.client_id.len())?;
        if let Some(username) = &self.config.username {
            check_field_len("username", username.len())?;
        }
        if let Some(password) = &self.config.password {
            check_field_len("password", password.len())?;
        }

        let mut transport = Transport::open(&self.config).await?;

        let connect = Connect {
            clean_session: self.config.clean_session,
            keep_alive: self.config.keep_alive,
            client_id: self.config.client_id.clone(),
            will: None,
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        };
        let mut buf = Vec::with_capacity(64);
        encode_packet(&Packet::Connect(connect), &mut buf);
        transport.write_all(&buf).await.map_err(ClientError::Io)?;

        let connack = tokio::time::timeout(
            self.config.connect_timeout,
            Self::wait_connack(&mut transport, &mut self.read_buf),
        )
        .await
        .map_err(|_| ClientError::ConnectionTimeout)??;

        if connack.code != ConnackCode::Accepted {
            return Err(ClientError::ConnectionRefused(format!(
                "{:?}",
                connack.code
            )));
        }

        self.transport = Some(transport);
        Ok(connack.session_present)
    }

    async fn wait_connack(transport: &mut Transport, read_buf: &mut BytesMut) -> Result<Connack> {
        loop {
            if let Some((packet, used)) = decode_packet(read_buf)? {
                let _ = read_buf.split_to(used);
                match packet {
                    Packet::Connack(connack) => return Ok(connack),
                    other => {
                        return Err(ClientError::InvalidState(format!(
                            "expected CONNACK, got {other:?}"
                        )))
                    }
                }
            }
            let n = transport.read_buf(read_buf).await.map_err(ClientError::Io)?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
        }
    }

    async fn on_connected(&mut self, session_present: bool) {
        self.session.phase = Phase::Connected;
        self.reconnect_attempt = 0;
        self.reconnect_delay = self.config.backoff.initial_delay;
        self.ping_outstanding = false;
        self.last_write = Instant::now();
        self.emit(ClientEvent::Connected { session_present }).await;
        if let Err(e) = self.replay_session() {
            log::warn!("session replay failed: {e}");
            self.emit(ClientEvent::Error {
                reason: e.to_string(),
            })
            .await;
        }
    }

    /// After (re)connect: resubscribe the table in original order, replay
    /// in-flight exchanges with DUP set, then flush the offline queue —
    /// all queued before any new publish command is processed.
    fn replay_session(&mut self) -> Result<()> {
        let subscriptions = self.session.subscriptions().to_vec();
        for sub in subscriptions {
            let packet_id = self.allocate_id()?;
            self.session
                .pend_subscribe(packet_id, sub.filter.clone(), sub.qos);
            encode_packet(
                &Packet::Subscribe(Subscribe {
                    packet_id,
                    topics: vec![(sub.filter, sub.qos)],
                }),
                &mut self.write_buf,
            );
        }

        for item in self.session.resend_after_reconnect() {
            encode_resend(item, &mut self.write_buf);
        }

        for queued in self.session.drain_queue() {
            self.send_publish(queued.topic, queued.payload, queued.qos, queued.retain)?;
        }
        Ok(())
    }

    async fn do_disconnect(&mut self) {
        let was_active = self.transport.is_some() || self.session.phase != Phase::Disconnected;
        if self.session.phase.is_connected() {
            self.session.phase = Phase::Disconnecting;
            let mut buf = std::mem::take(&mut self.write_buf);
            encode_packet(&Packet::Disconnect, &mut buf);
            if let Some(transport) = self.transport.as_mut() {
                let _ = transport.write_all(&buf).await;
            }
        }
        self.teardown_transport().await;
        for id in self.session.discard_inflight() {
            self.packet_ids.release(id);
        }
        self.session.phase = Phase::Disconnected;
        if was_active {
            self.emit(ClientEvent::Disconnected { reason: None }).await;
        }
    }

    async fn teardown_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.read_buf.clear();
        self.write_buf.clear();
        self.ping_outstanding = false;
    }

    /// Unexpected transport loss: hand the session to the reconnection
    /// supervisor, or surface a terminal error when it is disabled.
    async fn on_transport_loss(&mut self, reason: String) -> Flow {
        log::warn!("transport lost: {reason}");
        let recovering = self.config.auto_reconnect && self.session.phase.is_connected();
        self.teardown_transport().await;
        self.emit(ClientEvent::Disconnected {
            reason: Some(reason.clone()),
        })
        .await;
        if recovering {
            self.session.phase = Phase::Reconnecting;
        } else {
            self.session.phase = Phase::Disconnected;
            self.emit(ClientEvent::Error { reason }).await;
        }
        Flow::Continue
    }

    /// One supervisor step: back off (watching for commands), then attempt
    /// to reconnect. Stays in Reconnecting until success, cancellation, or
    /// the attempt budget runs out.
    async fn reconnect_tick(&mut self) -> Flow {
        let max_attempts = self.config.backoff.max_attempts;
        if max_attempts > 0 && self.reconnect_attempt >= max_attempts {
            let reason = format!("reconnect abandoned after {} attempts", self.reconnect_attempt);
            log::warn!("{reason}");
            self.session.phase = Phase::Disconnected;
            self.emit(ClientEvent::Error { reason }).await;
            return Flow::Continue;
        }

        self.reconnect_attempt += 1;
        let delay = apply_jitter(self.reconnect_delay, self.config.backoff.jitter);
        self.emit(ClientEvent::Reconnecting {
            attempt: self.reconnect_attempt,
            delay,
        })
        .await;

        enum Wake {
            Elapsed,
            Command(Option<Command>),
        }
        let wake = tokio::select! {
            _ = tokio::time::sleep(delay) => Wake::Elapsed,
            cmd = self.commands.recv() => Wake::Command(cmd),
        };
        match wake {
            Wake::Command(Some(cmd)) => {
                // The interrupted attempt never ran; don't count it.
                self.reconnect_attempt -= 1;
                return self.handle_command(cmd).await;
            }
            Wake::Command(None) => return Flow::Shutdown,
            Wake::Elapsed => {}
        }

        self.reconnect_delay = next_backoff(&self.config.backoff, self.reconnect_delay);

        match self.try_connect().await {
            Ok(session_present) => self.on_connected(session_present).await,
            Err(e) => {
                log::warn!(
                    "reconnect attempt {} failed: {e}",
                    self.reconnect_attempt
                );
                self.teardown_transport().await;
            }
        }
        Flow::Continue
    }

    // === Commands ===

    fn allocate_id(&mut self) -> Result<u16> {
        self.packet_ids
            .allocate()
            .ok_or_else(|| ClientError::InvalidState("all packet ids in use".to_string()))
    }

    fn do_publish(&mut self, topic: String, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        check_field_len("topic", topic.len())?;
        if !self.session.phase.is_connected() {
            if let Some(dropped) = self.session.queue_publish(QueuedPublish {
                topic,
                payload,
                qos,
                retain,
            }) {
                log::warn!(
                    "offline queue full, dropping oldest publish to {}",
                    dropped.topic
                );
            }
            return Ok(());
        }
        self.send_publish(topic, payload, qos, retain)
    }

    fn send_publish(&mut self, topic: String, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(self.allocate_id()?)
        };
        let topic = Bytes::from(topic);
        encode_packet(
            &Packet::Publish(Publish {
                dup: false,
                qos,
                retain,
                topic: topic.clone(),
                packet_id,
                payload: payload.clone(),
            }),
            &mut self.write_buf,
        );
        if let Some(id) = packet_id {
            let pending = InflightPublish::new(id, topic, payload, qos, retain);
            match qos {
                QoS::AtLeastOnce => self.session.add_qos1(pending),
                QoS::ExactlyOnce => self.session.add_qos2(pending),
                QoS::AtMostOnce => {}
            }
        }
        Ok(())
    }

    fn do_subscribe(&mut self, filter: String, qos: QoS) -> Result<()> {
        check_field_len("topic filter", filter.len())?;
        if !self.session.phase.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let packet_id = self.allocate_id()?;
        self.session.pend_subscribe(packet_id, filter.clone(), qos);
        encode_packet(
            &Packet::Subscribe(Subscribe {
                packet_id,
                topics: vec![(filter, qos)],
            }),
            &mut self.write_buf,
        );
        Ok(())
    }

    fn do_unsubscribe(&mut self, filter: String) -> Result<()> {
        check_field_len("topic filter", filter.len())?;
        if !self.session.phase.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let packet_id = self.allocate_id()?;
        self.session.pend_unsubscribe(packet_id, filter.clone());
        encode_packet(
            &Packet::Unsubscribe(Unsubscribe {
                packet_id,
                topics: vec![filter],
            }),
            &mut self.write_buf,
        );
        Ok(())
    }

    // === Timers ===

    async fn on_tick(&mut self) -> Flow {
        let now = Instant::now();

        if self.config.keep_alive > 0 && self.session.phase.is_connected() {
            let interval = Duration::from_secs(u64::from(self.config.keep_alive));
            if self.ping_outstanding && now.duration_since(self.last_ping) >= interval {
                return self
                    .on_transport_loss("keep-alive timeout".to_string())
                    .await;
            }
            if !self.ping_outstanding && now.duration_since(self.last_write) >= interval {
                encode_packet(&Packet::Pingreq, &mut self.write_buf);
                self.ping_outstanding = true;
                self.last_ping = now;
            }
        }

        let (resend, expired) = self.session.collect_retries(
            self.config.retry_interval,
            self.config.max_retries,
            now.into_std(),
        );
        for item in resend {
            encode_resend(item, &mut self.write_buf);
        }
        for packet_id in expired {
            self.packet_ids.release(packet_id);
            let err = ClientError::PublishTimeout {
                packet_id,
                retries: self.config.max_retries,
            };
            log::warn!("{err}");
            self.emit(ClientEvent::Error {
                reason: err.to_string(),
            })
            .await;
        }

        Flow::Continue
    }

    // === Inbound packets ===

    async fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Publish(publish) => self.handle_inbound_publish(publish).await,
            Packet::Puback { packet_id } => {
                if self.session.complete_qos1(packet_id).is_some() {
                    self.packet_ids.release(packet_id);
                } else {
                    log::debug!("PUBACK for unknown packet id {packet_id}");
                }
            }
            Packet::Pubrec { packet_id } => {
                if self.session.on_pubrec(packet_id) {
                    encode_packet(&Packet::Pubrel { packet_id }, &mut self.write_buf);
                }
            }
            Packet::Pubrel { packet_id } => {
                if let Some(message) = self.session.take_inbound_qos2(packet_id) {
                    self.deliver(message).await;
                }
                // PUBCOMP is due even for a retransmitted PUBREL.
                encode_packet(&Packet::Pubcomp { packet_id }, &mut self.write_buf);
            }
            Packet::Pubcomp { packet_id } => {
                if self.session.complete_qos2(packet_id).is_some() {
                    self.packet_ids.release(packet_id);
                }
            }
            Packet::Suback(suback) => {
                match self.session.on_suback(suback.packet_id, &suback.return_codes) {
                    Some(SubackOutcome::Granted { filter, qos }) => {
                        self.packet_ids.release(suback.packet_id);
                        self.emit(ClientEvent::Subscribed { filter, qos }).await;
                    }
                    Some(SubackOutcome::Rejected { filter }) => {
                        self.packet_ids.release(suback.packet_id);
                        let err = ClientError::SubscribeRejected { filter };
                        log::warn!("{err}");
                        self.emit(ClientEvent::Error {
                            reason: err.to_string(),
                        })
                        .await;
                    }
                    None => log::debug!("SUBACK for unknown packet id {}", suback.packet_id),
                }
            }
            Packet::Unsuback { packet_id } => match self.session.on_unsuback(packet_id) {
                Some(filter) => {
                    self.packet_ids.release(packet_id);
                    self.emit(ClientEvent::Unsubscribed { filter }).await;
                }
                None => log::debug!("UNSUBACK for unknown packet id {packet_id}"),
            },
            Packet::Pingresp => {
                self.ping_outstanding = false;
            }
            Packet::Disconnect => {
                let _ = self
                    .on_transport_loss("server-initiated disconnect".to_string())
                    .await;
            }
            // A broker never sends these; visible, never silent.
            other => {
                let reason = format!("unexpected packet from broker: {other:?}");
                log::warn!("{reason}");
                self.emit(ClientEvent::Error { reason }).await;
            }
        }
    }

    async fn handle_inbound_publish(&mut self, publish: Publish) {
        match publish.qos {
            QoS::AtMostOnce => self.deliver(publish).await,
            QoS::AtLeastOnce => {
                if let Some(packet_id) = publish.packet_id {
                    encode_packet(&Packet::Puback { packet_id }, &mut self.write_buf);
                }
                self.deliver(publish).await;
            }
            QoS::ExactlyOnce => {
                if let Some(packet_id) = publish.packet_id {
                    // Parked until PUBREL; duplicates are suppressed here.
                    self.session.register_inbound_qos2(publish);
                    encode_packet(&Packet::Pubrec { packet_id }, &mut self.write_buf);
                }
            }
        }
    }

    async fn deliver(&mut self, publish: Publish) {
        let topic = String::from_utf8_lossy(&publish.topic).to_string();
        self.emit(ClientEvent::Message {
            topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        })
        .await;
    }

    async fn emit(&mut self, event: ClientEvent) {
        let _ = self.events.send(event).await;
    }
}

fn encode_resend(item: Resend, buf: &mut Vec<u8>) {
    match item {
        Resend::Publish {
            packet_id,
            topic,
            payload,
            qos,
            retain,
        } => encode_packet(
            &Packet::Publish(Publish {
                dup: true,
                qos,
                retain,
                topic,
                packet_id: Some(packet_id),
                payload,
            }),
            buf,
        ),
        Resend::Pubrel { packet_id } => encode_packet(&Packet::Pubrel { packet_id }, buf),
    }
}

/// Grow the backoff delay, capped at the configured maximum.
fn next_backoff(config: &BackoffConfig, current: Duration) -> Duration {
    Duration::from_secs_f64(current.as_secs_f64() * config.multiplier).min(config.max_delay)
}

/// Randomize a delay within 0.5x..1.5x when jitter is enabled.
fn apply_jitter(delay: Duration, jitter: bool) -> Duration {
    if !jitter {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
