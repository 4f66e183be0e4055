//! Per-client session state.
//!
//! Tracks the connection phase, the ordered subscription table, QoS 1/2
//! exchanges in flight, inbound QoS 2 deduplication, and the bounded queue
//! of publishes issued while disconnected.
//!
//! Subscription entries are applied only once the matching SUBACK arrives;
//! until then the request is held pending by packet id. Inbound QoS 2
//! messages are held back until PUBREL so the application sees each one
//! exactly once, even when the broker retransmits the PUBLISH.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use wiremq_core::{Publish, QoS, SUBACK_FAILURE};

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Waiting out backoff after an unexpected transport loss.
    Reconnecting,
}

impl Phase {
    pub fn is_connected(self) -> bool {
        self == Phase::Connected
    }
}

/// An outbound QoS 1/2 publish awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct InflightPublish {
    pub packet_id: u16,
    pub topic: Bytes,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub last_sent: Instant,
    /// Times the packet has been put on the wire.
    pub send_count: u32,
}

impl InflightPublish {
    pub fn new(packet_id: u16, topic: Bytes, payload: Bytes, qos: QoS, retain: bool) -> Self {
        Self {
            packet_id,
            topic,
            payload,
            qos,
            retain,
            last_sent: Instant::now(),
            send_count: 1,
        }
    }

    fn mark_resent(&mut self) {
        self.last_sent = Instant::now();
        self.send_count += 1;
    }
}

/// Outbound QoS 2 handshake position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2OutState {
    AwaitingPubrec,
    AwaitingPubcomp,
}

#[derive(Debug, Clone)]
pub struct InflightQos2 {
    pub publish: InflightPublish,
    pub state: Qos2OutState,
}

/// Inbound QoS 2 message parked between PUBREC and PUBREL.
#[derive(Debug, Clone)]
struct InboundQos2 {
    packet_id: u16,
    message: Publish,
}

/// A granted subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

/// A publish deferred until the connection is (re-)established.
#[derive(Debug, Clone)]
pub struct QueuedPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// A frame that must be retransmitted.
#[derive(Debug, Clone)]
pub enum Resend {
    Publish {
        packet_id: u16,
        topic: Bytes,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    Pubrel {
        packet_id: u16,
    },
}

/// Outcome of matching a SUBACK against a pending subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubackOutcome {
    Granted { filter: String, qos: QoS },
    Rejected { filter: String },
}

/// Per-client mutable protocol state.
#[derive(Debug, Default)]
pub struct Session {
    pub phase: Phase,
    /// Granted subscriptions in original subscribe order.
    subscriptions: Vec<Subscription>,
    /// SUBSCRIBE requests awaiting SUBACK, keyed by packet id.
    pending_subscribes: Vec<(u16, String, QoS)>,
    /// UNSUBSCRIBE requests awaiting UNSUBACK.
    pending_unsubscribes: Vec<(u16, String)>,
    /// QoS 1 publishes awaiting PUBACK, in send order.
    pending_qos1: VecDeque<InflightPublish>,
    /// QoS 2 publishes in the PUBREC/PUBCOMP handshake, in send order.
    pending_qos2: VecDeque<InflightQos2>,
    /// Inbound QoS 2 messages awaiting PUBREL.
    inbound_qos2: Vec<InboundQos2>,
    /// Publishes issued while not connected.
    offline_queue: VecDeque<QueuedPublish>,
    queue_limit: usize,
}

impl Session {
    pub fn new(queue_limit: usize) -> Self {
        Self {
            queue_limit,
            ..Default::default()
        }
    }

    // === Offline queue ===

    /// Queue a publish for delivery after (re)connect. When the bounded
    /// queue is full the oldest entry is dropped and returned.
    pub fn queue_publish(&mut self, publish: QueuedPublish) -> Option<QueuedPublish> {
        let dropped = if self.offline_queue.len() >= self.queue_limit && self.queue_limit > 0 {
            self.offline_queue.pop_front()
        } else {
            None
        };
        self.offline_queue.push_back(publish);
        dropped
    }

    /// Take the queued publishes for flushing, oldest first.
    pub fn drain_queue(&mut self) -> Vec<QueuedPublish> {
        self.offline_queue.drain(..).collect()
    }

    pub fn queued_count(&self) -> usize {
        self.offline_queue.len()
    }

    // === Outbound QoS 1/2 ===

    pub fn add_qos1(&mut self, publish: InflightPublish) {
        debug_assert!(publish.qos == QoS::AtLeastOnce);
        self.pending_qos1.push_back(publish);
    }

    /// PUBACK received.
    pub fn complete_qos1(&mut self, packet_id: u16) -> Option<InflightPublish> {
        let pos = self
            .pending_qos1
            .iter()
            .position(|p| p.packet_id == packet_id)?;
        self.pending_qos1.remove(pos)
    }

    pub fn add_qos2(&mut self, publish: InflightPublish) {
        debug_assert!(publish.qos == QoS::ExactlyOnce);
        self.pending_qos2.push_back(InflightQos2 {
            publish,
            state: Qos2OutState::AwaitingPubrec,
        });
    }

    /// PUBREC received; returns true when the handshake advanced and a
    /// PUBREL should be sent.
    pub fn on_pubrec(&mut self, packet_id: u16) -> bool {
        match self
            .pending_qos2
            .iter_mut()
            .find(|p| p.publish.packet_id == packet_id)
        {
            Some(p) if p.state == Qos2OutState::AwaitingPubrec => {
                p.state = Qos2OutState::AwaitingPubcomp;
                p.publish.mark_resent();
                true
            }
            // Duplicate PUBREC: the PUBREL is re-sent by the retry timer.
            _ => false,
        }
    }

    /// PUBCOMP received.
    pub fn complete_qos2(&mut self, packet_id: u16) -> Option<InflightQos2> {
        let pos = self
            .pending_qos2
            .iter()
            .position(|p| p.publish.packet_id == packet_id)?;
        self.pending_qos2.remove(pos)
    }

    pub fn inflight_count(&self) -> usize {
        self.pending_qos1.len() + self.pending_qos2.len()
    }

    // === Inbound QoS 2 dedup ===

    /// Record an inbound QoS 2 PUBLISH. Returns false for a retransmission
    /// of a packet id already parked (the message must not be delivered
    /// again).
    pub fn register_inbound_qos2(&mut self, message: Publish) -> bool {
        let packet_id = match message.packet_id {
            Some(id) => id,
            None => return false,
        };
        if self.inbound_qos2.iter().any(|p| p.packet_id == packet_id) {
            return false;
        }
        self.inbound_qos2.push(InboundQos2 { packet_id, message });
        true
    }

    /// PUBREL received: release the parked message for delivery.
    pub fn take_inbound_qos2(&mut self, packet_id: u16) -> Option<Publish> {
        let pos = self
            .inbound_qos2
            .iter()
            .position(|p| p.packet_id == packet_id)?;
        Some(self.inbound_qos2.remove(pos).message)
    }

    // === Subscriptions ===

    pub fn pend_subscribe(&mut self, packet_id: u16, filter: String, qos: QoS) {
        self.pending_subscribes.push((packet_id, filter, qos));
    }

    pub fn pend_unsubscribe(&mut self, packet_id: u16, filter: String) {
        self.pending_unsubscribes.push((packet_id, filter));
    }

    /// Match a SUBACK against a pending subscribe. A granted code inserts
    /// the entry into the table (replacing a duplicate filter in place); a
    /// 0x80 code leaves the table untouched.
    pub fn on_suback(&mut self, packet_id: u16, return_codes: &[u8]) -> Option<SubackOutcome> {
        let pos = self
            .pending_subscribes
            .iter()
            .position(|(id, _, _)| *id == packet_id)?;
        let (_, filter, requested_qos) = self.pending_subscribes.remove(pos);

        match return_codes.first() {
            Some(&code) if code != SUBACK_FAILURE => {
                let granted = QoS::try_from(code).unwrap_or(requested_qos);
                match self.subscriptions.iter_mut().find(|s| s.filter == filter) {
                    Some(existing) => existing.qos = granted,
                    None => self.subscriptions.push(Subscription {
                        filter: filter.clone(),
                        qos: granted,
                    }),
                }
                Some(SubackOutcome::Granted {
                    filter,
                    qos: granted,
                })
            }
            _ => Some(SubackOutcome::Rejected { filter }),
        }
    }

    /// Match an UNSUBACK against a pending unsubscribe and drop the table
    /// entry. Returns the removed filter.
    pub fn on_unsuback(&mut self, packet_id: u16) -> Option<String> {
        let pos = self
            .pending_unsubscribes
            .iter()
            .position(|(id, _)| *id == packet_id)?;
        let (_, filter) = self.pending_unsubscribes.remove(pos);
        self.subscriptions.retain(|s| s.filter != filter);
        Some(filter)
    }

    /// Granted subscriptions in original subscribe order.
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    // === Retransmission ===

    /// Frames to replay after a reconnect, in original send order, with
    /// DUP implied for the PUBLISH entries.
    pub fn resend_after_reconnect(&mut self) -> Vec<Resend> {
        let now = Instant::now();
        let mut out = Vec::with_capacity(self.inflight_count());
        for p in &mut self.pending_qos1 {
            p.last_sent = now;
            p.send_count += 1;
            out.push(Resend::Publish {
                packet_id: p.packet_id,
                topic: p.topic.clone(),
                payload: p.payload.clone(),
                qos: p.qos,
                retain: p.retain,
            });
        }
        for p in &mut self.pending_qos2 {
            p.publish.last_sent = now;
            p.publish.send_count += 1;
            out.push(match p.state {
                Qos2OutState::AwaitingPubrec => Resend::Publish {
                    packet_id: p.publish.packet_id,
                    topic: p.publish.topic.clone(),
                    payload: p.publish.payload.clone(),
                    qos: p.publish.qos,
                    retain: p.publish.retain,
                },
                Qos2OutState::AwaitingPubcomp => Resend::Pubrel {
                    packet_id: p.publish.packet_id,
                },
            });
        }
        out
    }

    /// Retry-timer sweep: exchanges quiet past `interval` are re-sent;
    /// exchanges past `max_retries` retransmissions are abandoned and their
    /// packet ids returned for release.
    pub fn collect_retries(
        &mut self,
        interval: Duration,
        max_retries: u32,
        now: Instant,
    ) -> (Vec<Resend>, Vec<u16>) {
        let mut resend = Vec::new();
        let mut expired = Vec::new();

        self.pending_qos1.retain_mut(|p| {
            if now.duration_since(p.last_sent) < interval {
                return true;
            }
            if p.send_count > max_retries {
                expired.push(p.packet_id);
                return false;
            }
            p.mark_resent();
            resend.push(Resend::Publish {
                packet_id: p.packet_id,
                topic: p.topic.clone(),
                payload: p.payload.clone(),
                qos: p.qos,
                retain: p.retain,
            });
            true
        });

        self.pending_qos2.retain_mut(|p| {
            if now.duration_since(p.publish.last_sent) < interval {
                return true;
            }
            if p.publish.send_count > max_retries {
                expired.push(p.publish.packet_id);
                return false;
            }
            p.publish.mark_resent();
            resend.push(match p.state {
                Qos2OutState::AwaitingPubrec => Resend::Publish {
                    packet_id: p.publish.packet_id,
                    topic: p.publish.topic.clone(),
                    payload: p.publish.payload.clone(),
                    qos: p.publish.qos,
                    retain: p.publish.retain,
                },
                Qos2OutState::AwaitingPubcomp => Resend::Pubrel {
                    packet_id: p.publish.packet_id,
                },
            });
            true
        });

        (resend, expired)
    }

    /// Drop every pending exchange without retry (user disconnect or
    /// teardown). Returns the abandoned packet ids. The offline queue and
    /// subscription table survive for a later reconnect.
    pub fn discard_inflight(&mut self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.pending_qos1.iter().map(|p| p.packet_id).collect();
        ids.extend(self.pending_qos2.iter().map(|p| p.publish.packet_id));
        ids.extend(self.pending_subscribes.iter().map(|(id, _, _)| *id));
        ids.extend(self.pending_unsubscribes.iter().map(|(id, _)| *id));
        self.pending_qos1.clear();
        self.pending_qos2.clear();
        self.pending_subscribes.clear();
        self.pending_unsubscribes.clear();
        self.inbound_qos2.clear();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(id: u16, qos: QoS) -> InflightPublish {
        InflightPublish::new(
            id,
            Bytes::from_static(b"a/b"),
            Bytes::from_static(b"x"),
            qos,
            false,
        )
    }

    fn inbound(id: u16) -> Publish {
        Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: Bytes::from_static(b"a/b"),
            packet_id: Some(id),
            payload: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn qos1_lifecycle() {
        let mut session = Session::new(16);
        session.add_qos1(publish(1, QoS::AtLeastOnce));
        assert_eq!(session.inflight_count(), 1);
        assert!(session.complete_qos1(1).is_some());
        assert!(session.complete_qos1(1).is_none());
        assert_eq!(session.inflight_count(), 0);
    }

    #[test]
    fn qos2_outbound_handshake() {
        let mut session = Session::new(16);
        session.add_qos2(publish(1, QoS::ExactlyOnce));

        assert!(session.on_pubrec(1));
        // Duplicate PUBREC does not advance the handshake again.
        assert!(!session.on_pubrec(1));

        assert!(session.complete_qos2(1).is_some());
        assert_eq!(session.inflight_count(), 0);
    }

    #[test]
    fn inbound_qos2_delivers_exactly_once() {
        let mut session = Session::new(16);

        // First PUBLISH parks the message.
        assert!(session.register_inbound_qos2(inbound(100)));
        // Retransmitted PUBLISH with the same id is suppressed.
        assert!(!session.register_inbound_qos2(inbound(100)));

        // PUBREL releases it once.
        let msg = session.take_inbound_qos2(100).unwrap();
        assert_eq!(msg.packet_id, Some(100));
        assert!(session.take_inbound_qos2(100).is_none());
    }

    #[test]
    fn subscription_applied_only_on_suback() {
        let mut session = Session::new(16);
        session.pend_subscribe(5, "a/+".into(), QoS::AtLeastOnce);
        assert!(session.subscriptions().is_empty());

        let outcome = session.on_suback(5, &[1]).unwrap();
        assert_eq!(
            outcome,
            SubackOutcome::Granted {
                filter: "a/+".into(),
                qos: QoS::AtLeastOnce
            }
        );
        assert_eq!(session.subscriptions().len(), 1);

        // Unknown packet id is ignored.
        assert!(session.on_suback(99, &[0]).is_none());
    }

    #[test]
    fn rejected_suback_leaves_table_unchanged() {
        let mut session = Session::new(16);
        session.pend_subscribe(6, "deny/#".into(), QoS::AtMostOnce);
        let outcome = session.on_suback(6, &[SUBACK_FAILURE]).unwrap();
        assert_eq!(
            outcome,
            SubackOutcome::Rejected {
                filter: "deny/#".into()
            }
        );
        assert!(session.subscriptions().is_empty());
    }

    #[test]
    fn subscription_order_preserved_with_replacement() {
        let mut session = Session::new(16);
        for (id, filter) in [(1, "first"), (2, "second"), (3, "third")] {
            session.pend_subscribe(id, filter.into(), QoS::AtMostOnce);
            session.on_suback(id, &[0]);
        }
        // Re-subscribing an existing filter upgrades QoS in place.
        session.pend_subscribe(4, "first".into(), QoS::AtLeastOnce);
        session.on_suback(4, &[1]);

        let order: Vec<_> = session
            .subscriptions()
            .iter()
            .map(|s| (s.filter.as_str(), s.qos))
            .collect();
        assert_eq!(
            order,
            vec![
                ("first", QoS::AtLeastOnce),
                ("second", QoS::AtMostOnce),
                ("third", QoS::AtMostOnce),
            ]
        );
    }

    #[test]
    fn unsuback_removes_entry() {
        let mut session = Session::new(16);
        session.pend_subscribe(1, "a".into(), QoS::AtMostOnce);
        session.on_suback(1, &[0]);

        session.pend_unsubscribe(2, "a".into());
        assert_eq!(session.on_unsuback(2).as_deref(), Some("a"));
        assert!(session.subscriptions().is_empty());
    }

    #[test]
    fn offline_queue_drops_oldest_on_overflow() {
        let mut session = Session::new(2);
        let queued = |n: &str| QueuedPublish {
            topic: n.into(),
            payload: Bytes::new(),
            qos: QoS::AtMostOnce,
            retain: false,
        };

        assert!(session.queue_publish(queued("one")).is_none());
        assert!(session.queue_publish(queued("two")).is_none());
        let dropped = session.queue_publish(queued("three")).unwrap();
        assert_eq!(dropped.topic, "one");

        let flushed = session.drain_queue();
        let topics: Vec<_> = flushed.iter().map(|p| p.topic.as_str()).collect();
        assert_eq!(topics, vec!["two", "three"]);
    }

    #[test]
    fn resend_preserves_send_order_and_handshake_position() {
        let mut session = Session::new(16);
        session.add_qos1(publish(1, QoS::AtLeastOnce));
        session.add_qos2(publish(2, QoS::ExactlyOnce));
        session.add_qos2(publish(3, QoS::ExactlyOnce));
        session.on_pubrec(3);

        let resend = session.resend_after_reconnect();
        assert_eq!(resend.len(), 3);
        assert!(matches!(resend[0], Resend::Publish { packet_id: 1, .. }));
        assert!(matches!(resend[1], Resend::Publish { packet_id: 2, .. }));
        assert!(matches!(resend[2], Resend::Pubrel { packet_id: 3 }));
    }

    #[test]
    fn retry_sweep_resends_then_expires() {
        let mut session = Session::new(16);
        session.add_qos1(publish(1, QoS::AtLeastOnce));

        let interval = Duration::from_secs(0);
        let now = Instant::now();

        // send_count goes 1 -> 2 on the first sweep (max_retries 2 allows it).
        let (resend, expired) = session.collect_retries(interval, 2, now);
        assert_eq!(resend.len(), 1);
        assert!(expired.is_empty());

        let (resend, expired) = session.collect_retries(interval, 2, now);
        assert_eq!(resend.len(), 1);
        assert!(expired.is_empty());

        // Now send_count exceeds the budget: abandoned.
        let (resend, expired) = session.collect_retries(interval, 2, now);
        assert!(resend.is_empty());
        assert_eq!(expired, vec![1]);
        assert_eq!(session.inflight_count(), 0);
    }

    #[test]
    fn discard_inflight_releases_everything() {
        let mut session = Session::new(16);
        session.add_qos1(publish(1, QoS::AtLeastOnce));
        session.add_qos2(publish(2, QoS::ExactlyOnce));
        session.pend_subscribe(3, "a".into(), QoS::AtMostOnce);
        session.register_inbound_qos2(inbound(9));

        let mut ids = session.discard_inflight();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(session.inflight_count(), 0);
        assert!(session.take_inbound_qos2(9).is_none());
    }
}
