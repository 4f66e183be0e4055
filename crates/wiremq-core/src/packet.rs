//! MQTT 3.1.1 control packet types and codec.
//!
//! Every packet is a fixed header (type nibble + flags nibble), a
//! variable-byte-integer remaining length, and a type-specific body.
//! `decode_packet` is streaming: it returns `Ok(None)` until a whole frame
//! is buffered and errors only on frames that can never become valid.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::varint;

/// MQTT control packet types (the high nibble of the fixed header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQos(value)),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnackCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::UnacceptableProtocolVersion),
            2 => Ok(ConnackCode::IdentifierRejected),
            3 => Ok(ConnackCode::ServerUnavailable),
            4 => Ok(ConnackCode::BadUsernamePassword),
            5 => Ok(ConnackCode::NotAuthorized),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "invalid CONNACK return code: {value}"
            ))),
        }
    }
}

/// SUBACK failure return code.
pub const SUBACK_FAILURE: u8 = 0x80;

/// Last-will message carried in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: Bytes,
    /// Present iff `qos` > 0.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    /// One code per requested filter: 0x00-0x02 = granted QoS, 0x80 = failure.
    pub return_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// Any MQTT 3.1.1 control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

// === Encoding ===

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_u16(buf, s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

fn write_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    write_u16(buf, b.len() as u16);
    buf.extend_from_slice(b);
}

fn write_frame(header: u8, body: &[u8], out: &mut Vec<u8>) {
    out.push(header);
    varint::encode_to_vec(body.len() as u32, out);
    out.extend_from_slice(body);
}

/// Encode a packet onto `out` in MQTT 3.1.1 wire format.
pub fn encode_packet(packet: &Packet, out: &mut Vec<u8>) {
    match packet {
        Packet::Connect(c) => {
            let mut body = Vec::with_capacity(32 + c.client_id.len());
            write_str(&mut body, "MQTT");
            body.push(4); // protocol level 3.1.1

            let mut flags = 0u8;
            if c.clean_session {
                flags |= 0x02;
            }
            if let Some(will) = &c.will {
                flags |= 0x04;
                flags |= (will.qos as u8) << 3;
                if will.retain {
                    flags |= 0x20;
                }
            }
            if c.password.is_some() {
                flags |= 0x40;
            }
            if c.username.is_some() {
                flags |= 0x80;
            }
            body.push(flags);
            write_u16(&mut body, c.keep_alive);

            write_str(&mut body, &c.client_id);
            if let Some(will) = &c.will {
                write_str(&mut body, &will.topic);
                write_bytes(&mut body, &will.message);
            }
            if let Some(username) = &c.username {
                write_str(&mut body, username);
            }
            if let Some(password) = &c.password {
                write_bytes(&mut body, password);
            }
            write_frame(0x10, &body, out);
        }
        Packet::Connack(c) => {
            let body = [u8::from(c.session_present), c.code as u8];
            write_frame(0x20, &body, out);
        }
        Packet::Publish(p) => {
            let mut header = 0x30;
            if p.dup {
                header |= 0x08;
            }
            header |= (p.qos as u8) << 1;
            if p.retain {
                header |= 0x01;
            }
            let mut body = Vec::with_capacity(4 + p.topic.len() + p.payload.len());
            write_u16(&mut body, p.topic.len() as u16);
            body.extend_from_slice(&p.topic);
            if let Some(id) = p.packet_id {
                write_u16(&mut body, id);
            }
            body.extend_from_slice(&p.payload);
            write_frame(header, &body, out);
        }
        Packet::Puback { packet_id } => write_frame(0x40, &packet_id.to_be_bytes(), out),
        Packet::Pubrec { packet_id } => write_frame(0x50, &packet_id.to_be_bytes(), out),
        Packet::Pubrel { packet_id } => write_frame(0x62, &packet_id.to_be_bytes(), out),
        Packet::Pubcomp { packet_id } => write_frame(0x70, &packet_id.to_be_bytes(), out),
        Packet::Subscribe(s) => {
            let mut body = Vec::new();
            write_u16(&mut body, s.packet_id);
            for (filter, qos) in &s.topics {
                write_str(&mut body, filter);
                body.push(*qos as u8);
            }
            write_frame(0x82, &body, out);
        }
        Packet::Suback(s) => {
            let mut body = Vec::with_capacity(2 + s.return_codes.len());
            write_u16(&mut body, s.packet_id);
            body.extend_from_slice(&s.return_codes);
            write_frame(0x90, &body, out);
        }
        Packet::Unsubscribe(u) => {
            let mut body = Vec::new();
            write_u16(&mut body, u.packet_id);
            for filter in &u.topics {
                write_str(&mut body, filter);
            }
            write_frame(0xA2, &body, out);
        }
        Packet::Unsuback { packet_id } => write_frame(0xB0, &packet_id.to_be_bytes(), out),
        Packet::Pingreq => out.extend_from_slice(&[0xC0, 0x00]),
        Packet::Pingresp => out.extend_from_slice(&[0xD0, 0x00]),
        Packet::Disconnect => out.extend_from_slice(&[0xE0, 0x00]),
    }
}

// === Decoding ===

/// Cursor over one complete packet body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| ProtocolError::MalformedPacket("truncated body".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::MalformedPacket("truncated body".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::MalformedPacket("invalid UTF-8 string".into()))
    }

    fn bytes_field(&mut self) -> Result<Vec<u8>> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

fn packet_id_body(body: &[u8]) -> Result<u16> {
    if body.len() != 2 {
        return Err(ProtocolError::MalformedPacket(
            "ack body must be exactly a packet id".into(),
        ));
    }
    Ok(u16::from_be_bytes([body[0], body[1]]))
}

fn expect_flags(flags: u8, expected: u8, kind: PacketType) -> Result<()> {
    if flags != expected {
        return Err(ProtocolError::MalformedPacket(format!(
            "invalid fixed-header flags {flags:#x} for {kind:?}"
        )));
    }
    Ok(())
}

/// Decode one packet from the front of `buf`.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` when a full frame is
/// available, `Ok(None)` when more bytes are needed, and an error for
/// frames that violate the protocol.
pub fn decode_packet(buf: &[u8]) -> Result<Option<(Packet, usize)>> {
    let Some(&header) = buf.first() else {
        return Ok(None);
    };
    let kind = PacketType::try_from(header >> 4)?;
    let flags = header & 0x0F;

    let Some((remaining, varint_len)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };
    let total = 1 + varint_len + remaining;
    if buf.len() < total {
        return Ok(None);
    }
    let body = &buf[1 + varint_len..total];

    let packet = match kind {
        PacketType::Connect => {
            expect_flags(flags, 0, kind)?;
            decode_connect(body)?
        }
        PacketType::Connack => {
            expect_flags(flags, 0, kind)?;
            if body.len() != 2 {
                return Err(ProtocolError::MalformedPacket(
                    "CONNACK body must be 2 bytes".into(),
                ));
            }
            if body[0] & !0x01 != 0 {
                return Err(ProtocolError::MalformedPacket(
                    "reserved CONNACK acknowledge flags set".into(),
                ));
            }
            Packet::Connack(Connack {
                session_present: body[0] & 0x01 != 0,
                code: ConnackCode::try_from(body[1])?,
            })
        }
        PacketType::Publish => decode_publish(flags, body)?,
        PacketType::Puback => {
            expect_flags(flags, 0, kind)?;
            Packet::Puback {
                packet_id: packet_id_body(body)?,
            }
        }
        PacketType::Pubrec => {
            expect_flags(flags, 0, kind)?;
            Packet::Pubrec {
                packet_id: packet_id_body(body)?,
            }
        }
        PacketType::Pubrel => {
            expect_flags(flags, 0x02, kind)?;
            Packet::Pubrel {
                packet_id: packet_id_body(body)?,
            }
        }
        PacketType::Pubcomp => {
            expect_flags(flags, 0, kind)?;
            Packet::Pubcomp {
                packet_id: packet_id_body(body)?,
            }
        }
        PacketType::Subscribe => {
            expect_flags(flags, 0x02, kind)?;
            decode_subscribe(body)?
        }
        PacketType::Suback => {
            expect_flags(flags, 0, kind)?;
            let mut r = Reader::new(body);
            let packet_id = r.u16()?;
            let return_codes = r.rest().to_vec();
            if return_codes.is_empty() {
                return Err(ProtocolError::MalformedPacket(
                    "SUBACK without return codes".into(),
                ));
            }
            Packet::Suback(Suback {
                packet_id,
                return_codes,
            })
        }
        PacketType::Unsubscribe => {
            expect_flags(flags, 0x02, kind)?;
            let mut r = Reader::new(body);
            let packet_id = r.u16()?;
            let mut topics = Vec::new();
            while r.remaining() > 0 {
                topics.push(r.string()?);
            }
            if topics.is_empty() {
                return Err(ProtocolError::MalformedPacket(
                    "UNSUBSCRIBE without topic filters".into(),
                ));
            }
            Packet::Unsubscribe(Unsubscribe { packet_id, topics })
        }
        PacketType::Unsuback => {
            expect_flags(flags, 0, kind)?;
            Packet::Unsuback {
                packet_id: packet_id_body(body)?,
            }
        }
        PacketType::Pingreq => {
            expect_flags(flags, 0, kind)?;
            Packet::Pingreq
        }
        PacketType::Pingresp => {
            expect_flags(flags, 0, kind)?;
            Packet::Pingresp
        }
        PacketType::Disconnect => {
            expect_flags(flags, 0, kind)?;
            Packet::Disconnect
        }
    };

    Ok(Some((packet, total)))
}

fn decode_connect(body: &[u8]) -> Result<Packet> {
    let mut r = Reader::new(body);
    let protocol_name = r.string()?;
    if protocol_name != "MQTT" {
        return Err(ProtocolError::MalformedPacket(format!(
            "unexpected protocol name: {protocol_name}"
        )));
    }
    let level = r.u8()?;
    if level != 4 {
        return Err(ProtocolError::MalformedPacket(format!(
            "unsupported protocol level: {level}"
        )));
    }
    let flags = r.u8()?;
    if flags & 0x01 != 0 {
        return Err(ProtocolError::MalformedPacket(
            "reserved CONNECT flag set".into(),
        ));
    }
    let keep_alive = r.u16()?;
    let client_id = r.string()?;

    let will = if flags & 0x04 != 0 {
        let topic = r.string()?;
        let message = r.bytes_field()?;
        Some(Will {
            topic,
            message,
            qos: QoS::try_from((flags >> 3) & 0x03)?,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };
    let username = if flags & 0x80 != 0 {
        Some(r.string()?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(r.bytes_field()?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        clean_session: flags & 0x02 != 0,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet> {
    let dup = flags & 0x08 != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = flags & 0x01 != 0;

    let mut r = Reader::new(body);
    let topic_len = r.u16()? as usize;
    let topic = Bytes::copy_from_slice(r.take(topic_len)?);
    if topic.is_empty() {
        return Err(ProtocolError::MalformedPacket("empty topic name".into()));
    }
    let packet_id = if qos != QoS::AtMostOnce {
        let id = r.u16()?;
        if id == 0 {
            return Err(ProtocolError::MalformedPacket("packet id must be non-zero".into()));
        }
        Some(id)
    } else {
        None
    };
    let payload = Bytes::copy_from_slice(r.rest());

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
    }))
}

fn decode_subscribe(body: &[u8]) -> Result<Packet> {
    let mut r = Reader::new(body);
    let packet_id = r.u16()?;
    let mut topics = Vec::new();
    while r.remaining() > 0 {
        let filter = r.string()?;
        let opts = r.u8()?;
        if opts & !0x03 != 0 {
            return Err(ProtocolError::MalformedPacket(
                "reserved subscription option bits set".into(),
            ));
        }
        topics.push((filter, QoS::try_from(opts)?));
    }
    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "SUBSCRIBE without topic filters".into(),
        ));
    }
    Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
}
