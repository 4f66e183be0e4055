//! End-to-end session tests against a scripted in-process broker.
//!
//! Each test binds a loopback listener and plays the broker side of the
//! conversation frame by frame, asserting both what the client puts on
//! the wire and the events it emits.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use wiremq_client::{
    AsyncClient, BackoffConfig, ClientConfig, ClientError, ClientEvent, QoS,
};
use wiremq_core::{decode_packet, encode_packet, Connack, ConnackCode, Packet, Publish, Suback};

struct BrokerConn {
    stream: TcpStream,
    buf: BytesMut,
}

impl BrokerConn {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.expect("accept");
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    async fn read_packet(&mut self) -> Packet {
        loop {
            if let Some((packet, used)) = decode_packet(&self.buf).expect("well-formed frame") {
                let _ = self.buf.split_to(used);
                return packet;
            }
            let n = self.stream.read_buf(&mut self.buf).await.expect("read");
            assert!(n > 0, "client closed mid-script");
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut out = Vec::new();
        encode_packet(packet, &mut out);
        self.stream.write_all(&out).await.expect("write");
    }

    /// Accept the CONNECT and reply with a successful CONNACK.
    async fn handshake(&mut self) {
        let packet = self.read_packet().await;
        assert!(matches!(packet, Packet::Connect(_)), "expected CONNECT");
        self.send(&Packet::Connack(Connack {
            session_present: false,
            code: ConnackCode::Accepted,
        }))
        .await;
    }
}

fn test_config(port: u16) -> ClientConfig {
    ClientConfig::new("127.0.0.1", port)
        .client_id("itest")
        .keep_alive(0)
        .connect_timeout(Duration::from_secs(2))
        .auto_reconnect(false)
}

fn spawn_client(config: ClientConfig) -> (AsyncClient, mpsc::Receiver<ClientEvent>) {
    let (events_tx, events_rx) = mpsc::channel(64);
    let (client, event_loop) = AsyncClient::new(config, events_tx);
    tokio::spawn(event_loop.run());
    (client, events_rx)
}

async fn next_event(events: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within deadline")
        .expect("event channel open")
}

#[tokio::test]
async fn qos1_publish_both_directions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (client, mut events) = spawn_client(test_config(port));

    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::accept(&listener).await;
        conn.handshake().await;

        let subscribe = match conn.read_packet().await {
            Packet::Subscribe(s) => s,
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        };
        assert_eq!(
            subscribe.topics,
            vec![("demo/#".to_string(), QoS::AtLeastOnce)]
        );
        conn.send(&Packet::Suback(Suback {
            packet_id: subscribe.packet_id,
            return_codes: vec![1],
        }))
        .await;

        let publish = match conn.read_packet().await {
            Packet::Publish(p) => p,
            other => panic!("expected PUBLISH, got {other:?}"),
        };
        assert_eq!(&publish.topic[..], b"demo/out");
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        conn.send(&Packet::Puback {
            packet_id: publish.packet_id.unwrap(),
        })
        .await;

        conn.send(&Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from_static(b"demo/in"),
            packet_id: Some(7),
            payload: Bytes::from_static(b"ping"),
        }))
        .await;
        let ack = conn.read_packet().await;
        assert!(matches!(ack, Packet::Puback { packet_id: 7 }));
        conn
    });

    client.connect().await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Connected { .. }
    ));

    client.subscribe("demo/#", QoS::AtLeastOnce).await.unwrap();
    match next_event(&mut events).await {
        ClientEvent::Subscribed { filter, qos } => {
            assert_eq!(filter, "demo/#");
            assert_eq!(qos, QoS::AtLeastOnce);
        }
        other => panic!("expected Subscribed, got {other:?}"),
    }

    client
        .publish("demo/out", b"hi", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    match next_event(&mut events).await {
        ClientEvent::Message {
            topic,
            payload,
            qos,
            ..
        } => {
            assert_eq!(topic, "demo/in");
            assert_eq!(&payload[..], b"ping");
            assert_eq!(qos, QoS::AtLeastOnce);
        }
        other => panic!("expected Message, got {other:?}"),
    }

    broker.await.unwrap();
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn inbound_qos2_delivered_exactly_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (client, mut events) = spawn_client(test_config(port));

    let inbound = Publish {
        dup: false,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: Bytes::from_static(b"once/only"),
        packet_id: Some(9),
        payload: Bytes::from_static(b"payload"),
    };

    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::accept(&listener).await;
        conn.handshake().await;

        conn.send(&Packet::Publish(inbound.clone())).await;
        assert!(matches!(
            conn.read_packet().await,
            Packet::Pubrec { packet_id: 9 }
        ));

        // Retransmission before PUBREL: re-acked, not re-delivered.
        let mut dup = inbound;
        dup.dup = true;
        conn.send(&Packet::Publish(dup)).await;
        assert!(matches!(
            conn.read_packet().await,
            Packet::Pubrec { packet_id: 9 }
        ));

        conn.send(&Packet::Pubrel { packet_id: 9 }).await;
        assert!(matches!(
            conn.read_packet().await,
            Packet::Pubcomp { packet_id: 9 }
        ));
        conn
    });

    client.connect().await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Connected { .. }
    ));

    match next_event(&mut events).await {
        ClientEvent::Message { topic, payload, .. } => {
            assert_eq!(topic, "once/only");
            assert_eq!(&payload[..], b"payload");
        }
        other => panic!("expected Message, got {other:?}"),
    }

    // No second delivery for the duplicate.
    assert!(
        timeout(Duration::from_millis(200), events.recv())
            .await
            .is_err(),
        "duplicate QoS 2 publish must not be delivered twice"
    );

    broker.await.unwrap();
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn reconnect_replays_subscriptions_and_queued_publishes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = test_config(port)
        .auto_reconnect(true)
        .backoff(BackoffConfig {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: false,
            max_attempts: 0,
        });
    let (client, mut events) = spawn_client(config);

    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::accept(&listener).await;
        conn.handshake().await;
        let subscribe = match conn.read_packet().await {
            Packet::Subscribe(s) => s,
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        };
        conn.send(&Packet::Suback(Suback {
            packet_id: subscribe.packet_id,
            return_codes: vec![0],
        }))
        .await;
        drop(conn);

        // The client comes back on its own and replays the session.
        let mut conn = BrokerConn::accept(&listener).await;
        conn.handshake().await;
        let replay = match conn.read_packet().await {
            Packet::Subscribe(s) => s,
            other => panic!("expected replayed SUBSCRIBE, got {other:?}"),
        };
        assert_eq!(replay.topics, vec![("demo/#".to_string(), QoS::AtMostOnce)]);
        conn.send(&Packet::Suback(Suback {
            packet_id: replay.packet_id,
            return_codes: vec![0],
        }))
        .await;

        let flushed = match conn.read_packet().await {
            Packet::Publish(p) => p,
            other => panic!("expected flushed PUBLISH, got {other:?}"),
        };
        assert_eq!(&flushed.topic[..], b"queued/x");
        assert_eq!(&flushed.payload[..], b"later");
        conn
    });

    client.connect().await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Connected { .. }
    ));
    client.subscribe("demo/#", QoS::AtMostOnce).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Subscribed { .. }
    ));

    match next_event(&mut events).await {
        ClientEvent::Disconnected { reason } => assert!(reason.is_some()),
        other => panic!("expected Disconnected, got {other:?}"),
    }

    // Issued while down: queued, then flushed after the reconnect.
    client
        .publish("queued/x", b"later", QoS::AtMostOnce, false)
        .await
        .unwrap();

    let mut saw_reconnecting = false;
    loop {
        match next_event(&mut events).await {
            ClientEvent::Reconnecting { .. } => saw_reconnecting = true,
            ClientEvent::Connected { .. } => break,
            other => panic!("unexpected event while reconnecting: {other:?}"),
        }
    }
    assert!(saw_reconnecting);
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Subscribed { .. }
    ));

    broker.await.unwrap();
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn supervisor_engages_after_failed_initial_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = test_config(port)
        .connect_timeout(Duration::from_millis(300))
        .auto_reconnect(true)
        .backoff(BackoffConfig {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: false,
            max_attempts: 0,
        });
    let (client, mut events) = spawn_client(config);

    let broker = tokio::spawn(async move {
        // Withhold the CONNACK; the client gives up at its connect timeout.
        let mut starved = BrokerConn::accept(&listener).await;
        assert!(matches!(starved.read_packet().await, Packet::Connect(_)));

        let mut conn = BrokerConn::accept(&listener).await;
        conn.handshake().await;
        drop(starved);
        conn
    });

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectionTimeout));

    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Error { .. }
    ));
    match next_event(&mut events).await {
        ClientEvent::Reconnecting { attempt, .. } => assert_eq!(attempt, 1),
        other => panic!("expected Reconnecting, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Connected { .. }
    ));

    broker.await.unwrap();
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn queued_qos1_publish_flushed_with_one_puback_exchange() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = test_config(port)
        .auto_reconnect(true)
        .publish_retry(Duration::from_millis(200), 5)
        .backoff(BackoffConfig {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: false,
            max_attempts: 0,
        });
    let (client, mut events) = spawn_client(config);

    let broker = tokio::spawn(async move {
        let conn = {
            let mut conn = BrokerConn::accept(&listener).await;
            conn.handshake().await;
            conn
        };
        drop(conn);

        let mut conn = BrokerConn::accept(&listener).await;
        conn.handshake().await;

        let flushed = match conn.read_packet().await {
            Packet::Publish(p) => p,
            other => panic!("expected flushed PUBLISH, got {other:?}"),
        };
        assert_eq!(&flushed.topic[..], b"queued/q1");
        assert_eq!(&flushed.payload[..], b"once");
        assert_eq!(flushed.qos, QoS::AtLeastOnce);
        assert!(!flushed.dup, "flush is a first transmission, not a retry");
        let packet_id = flushed.packet_id.expect("QoS 1 publish carries an id");
        conn.send(&Packet::Puback { packet_id }).await;

        // Acked: the retry timer must not retransmit it.
        assert!(
            timeout(Duration::from_millis(500), conn.read_packet())
                .await
                .is_err(),
            "acknowledged publish was retransmitted"
        );
        conn
    });

    client.connect().await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Connected { .. }
    ));
    match next_event(&mut events).await {
        ClientEvent::Disconnected { reason } => assert!(reason.is_some()),
        other => panic!("expected Disconnected, got {other:?}"),
    }

    client
        .publish("queued/q1", b"once", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    loop {
        match next_event(&mut events).await {
            ClientEvent::Reconnecting { .. } => continue,
            ClientEvent::Connected { .. } => break,
            other => panic!("unexpected event while reconnecting: {other:?}"),
        }
    }

    broker.await.unwrap();
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn oversized_fields_are_rejected() {
    // Never connects; validation happens before any queueing or I/O.
    let (client, _events) = spawn_client(test_config(1));
    let topic = "x".repeat(u16::MAX as usize + 1);

    let err = client
        .publish(&topic, b"", QoS::AtMostOnce, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Config(_)));

    let err = client.subscribe(&topic, QoS::AtMostOnce).await.unwrap_err();
    assert!(matches!(err, ClientError::Config(_)));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn rejected_connack_fails_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (client, mut events) = spawn_client(test_config(port));

    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::accept(&listener).await;
        let packet = conn.read_packet().await;
        assert!(matches!(packet, Packet::Connect(_)));
        conn.send(&Packet::Connack(Connack {
            session_present: false,
            code: ConnackCode::NotAuthorized,
        }))
        .await;
    });

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectionRefused(_)));
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Error { .. }
    ));
    assert!(!client.is_connected().await.unwrap());

    broker.await.unwrap();
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn keep_alive_pings_when_idle() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = test_config(port).keep_alive(1);
    let (client, mut events) = spawn_client(config);

    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::accept(&listener).await;
        conn.handshake().await;
        assert!(matches!(conn.read_packet().await, Packet::Pingreq));
        conn.send(&Packet::Pingresp).await;
        // A marker the client can observe once the ping exchange is done.
        conn.send(&Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Bytes::from_static(b"after/ping"),
            packet_id: None,
            payload: Bytes::new(),
        }))
        .await;
        // Clean shutdown ends with DISCONNECT.
        assert!(matches!(conn.read_packet().await, Packet::Disconnect));
    });

    client.connect().await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Connected { .. }
    ));

    // Stay idle past the keep-alive interval; the loop pings by itself.
    match timeout(Duration::from_secs(4), events.recv())
        .await
        .expect("ping exchange within keep-alive window")
        .expect("event channel open")
    {
        ClientEvent::Message { topic, .. } => assert_eq!(topic, "after/ping"),
        other => panic!("expected marker Message, got {other:?}"),
    }

    client.shutdown().await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Disconnected { reason: None }
    ));
    broker.await.unwrap();
}

#[tokio::test]
async fn receive_only_client_still_pings() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = test_config(port).keep_alive(1);
    let (client, mut events) = spawn_client(config);

    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::accept(&listener).await;
        conn.handshake().await;

        // Keep-alive counts client-sent traffic, so a steady inbound
        // stream must not postpone the PINGREQ.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no PINGREQ despite an idle writer"
            );
            conn.send(&Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: Bytes::from_static(b"steady/stream"),
                packet_id: None,
                payload: Bytes::from_static(b"tick"),
            }))
            .await;
            match timeout(Duration::from_millis(200), conn.read_packet()).await {
                Ok(Packet::Pingreq) => break,
                Ok(other) => panic!("expected PINGREQ, got {other:?}"),
                Err(_) => {}
            }
        }
        conn.send(&Packet::Pingresp).await;
    });

    client.connect().await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Connected { .. }
    ));

    // Drain the inbound messages while waiting for the broker to observe
    // the ping.
    let drain = tokio::spawn(async move { while events.recv().await.is_some() {} });

    timeout(Duration::from_secs(5), broker)
        .await
        .expect("ping within the keep-alive window")
        .unwrap();

    client.shutdown().await.unwrap();
    drain.abort();
}
