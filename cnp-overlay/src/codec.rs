//! Binary codec for overlay envelopes.
//!
//! # Wire Format
//!
//! ```text
//! version(1) | type(1) | from(node) | to(node) | has_route(1) [route] | body
//! ```
//!
//! All integers are little-endian. A node is `family(1) | ip(4 or 16) |
//! port(2) | joined_at_ms(8)`. Cluster ids are `depth(2) | slot(2)*depth`.
//! Variable-length data carries its own length prefix.

use crate::events::Cause;
use crate::message::{DeliveryKind, Envelope, Forward, Message, MessageId, Route};
use crate::snapshot::{ClusterView, Placement};
use crate::table::ClusterTable;
use bytes::{BufMut, Bytes, BytesMut};
use cnp_core::{CanopyError, ClusterId, NodeId, PROTOCOL_VERSION, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    JoinRequest = 1,
    JoinAck = 2,
    Relocate = 3,
    TableUpdate = 4,
    LeaderNotice = 5,
    Stage1 = 10,
    Stage2 = 11,
    Stage3 = 12,
    Stage1Ack = 13,
    Stage2Ack = 14,
    Stage3Ack = 15,
    Stage3Release = 16,
    RoutingError = 20,
    Ping = 30,
    Pong = 31,
    Fault = 40,
}

impl MessageType {
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::JoinRequest),
            2 => Some(Self::JoinAck),
            3 => Some(Self::Relocate),
            4 => Some(Self::TableUpdate),
            5 => Some(Self::LeaderNotice),
            10 => Some(Self::Stage1),
            11 => Some(Self::Stage2),
            12 => Some(Self::Stage3),
            13 => Some(Self::Stage1Ack),
            14 => Some(Self::Stage2Ack),
            15 => Some(Self::Stage3Ack),
            16 => Some(Self::Stage3Release),
            20 => Some(Self::RoutingError),
            30 => Some(Self::Ping),
            31 => Some(Self::Pong),
            40 => Some(Self::Fault),
            _ => None,
        }
    }

    #[must_use]
    pub const fn of(message: &Message) -> Self {
        match message {
            Message::JoinRequest { .. } => Self::JoinRequest,
            Message::JoinAck { .. } => Self::JoinAck,
            Message::Relocate { .. } => Self::Relocate,
            Message::TableUpdate { .. } => Self::TableUpdate,
            Message::LeaderNotice { .. } => Self::LeaderNotice,
            Message::Stage1(_) => Self::Stage1,
            Message::Stage2(_) => Self::Stage2,
            Message::Stage3(_) => Self::Stage3,
            Message::Stage1Ack(_) => Self::Stage1Ack,
            Message::Stage2Ack(_) => Self::Stage2Ack,
            Message::Stage3Ack(_) => Self::Stage3Ack,
            Message::Stage3Release(_) => Self::Stage3Release,
            Message::RoutingError { .. } => Self::RoutingError,
            Message::Ping => Self::Ping,
            Message::Pong => Self::Pong,
            Message::Fault { .. } => Self::Fault,
        }
    }
}

pub struct OverlayCodec;

impl OverlayCodec {
    pub fn encode(envelope: &Envelope) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(128);
        encode_envelope(&mut buf, envelope)?;
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Envelope> {
        let mut reader = Reader::new(data);
        let envelope = decode_envelope(&mut reader, true)?;
        if reader.remaining() != 0 {
            return Err(CanopyError::InvalidData(format!(
                "{} trailing bytes after envelope",
                reader.remaining()
            )));
        }
        Ok(envelope)
    }
}

fn encode_envelope(buf: &mut BytesMut, envelope: &Envelope) -> Result<()> {
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(MessageType::of(&envelope.body) as u8);
    put_node(buf, &envelope.from);
    put_node(buf, &envelope.to);
    match &envelope.route {
        Some(route) => {
            buf.put_u8(1);
            put_cluster_id(buf, &route.from)?;
            put_cluster_id(buf, &route.to)?;
        },
        None => buf.put_u8(0),
    }

    match &envelope.body {
        Message::JoinRequest { joiner } => put_node(buf, joiner),
        Message::JoinAck { placement } | Message::Relocate { placement } => {
            put_placement(buf, placement)?;
        },
        Message::TableUpdate {
            view,
            cause,
            affected,
        } => {
            put_view(buf, view)?;
            buf.put_u8(cause.as_u8());
            put_optional_node(buf, affected.as_ref());
        },
        Message::LeaderNotice { failed } => put_node(buf, failed),
        Message::Stage1(fwd) | Message::Stage2(fwd) | Message::Stage3(fwd) => {
            put_message_id(buf, &fwd.id);
            buf.put_u8(fwd.kind.as_u8());
            put_len_u32(buf, fwd.payload.len())?;
            buf.put_slice(&fwd.payload);
        },
        Message::Stage1Ack(id)
        | Message::Stage2Ack(id)
        | Message::Stage3Ack(id)
        | Message::Stage3Release(id) => put_message_id(buf, id),
        Message::RoutingError { original } => {
            if matches!(original.body, Message::RoutingError { .. }) {
                return Err(CanopyError::Protocol(
                    "routing error cannot wrap a routing error".into(),
                ));
            }
            let mut inner = BytesMut::with_capacity(128);
            encode_envelope(&mut inner, original)?;
            put_len_u32(buf, inner.len())?;
            buf.put_slice(&inner);
        },
        Message::Ping | Message::Pong => {},
        Message::Fault { reason } => {
            put_len_u16(buf, reason.len())?;
            buf.put_slice(reason.as_bytes());
        },
    }
    Ok(())
}

fn decode_envelope(reader: &mut Reader<'_>, allow_nested: bool) -> Result<Envelope> {
    let version = reader.u8()?;
    if version != PROTOCOL_VERSION {
        return Err(CanopyError::UnsupportedVersion(version));
    }
    let raw_type = reader.u8()?;
    let msg_type = MessageType::from_u8(raw_type).ok_or(CanopyError::UnknownMessageType(raw_type))?;

    let from = reader.node()?;
    let to = reader.node()?;
    let route = match reader.u8()? {
        0 => None,
        1 => Some(Route {
            from: reader.cluster_id()?,
            to: reader.cluster_id()?,
        }),
        other => {
            return Err(CanopyError::InvalidData(format!("bad route flag {other}")));
        },
    };

    let body = match msg_type {
        MessageType::JoinRequest => Message::JoinRequest {
            joiner: reader.node()?,
        },
        MessageType::JoinAck => Message::JoinAck {
            placement: reader.placement()?,
        },
        MessageType::Relocate => Message::Relocate {
            placement: reader.placement()?,
        },
        MessageType::TableUpdate => {
            let view = reader.view()?;
            let raw_cause = reader.u8()?;
            let cause = Cause::from_u8(raw_cause)
                .ok_or_else(|| CanopyError::InvalidData(format!("bad cause {raw_cause}")))?;
            let affected = reader.optional_node()?;
            Message::TableUpdate {
                view,
                cause,
                affected,
            }
        },
        MessageType::LeaderNotice => Message::LeaderNotice {
            failed: reader.node()?,
        },
        MessageType::Stage1 => Message::Stage1(reader.forward()?),
        MessageType::Stage2 => Message::Stage2(reader.forward()?),
        MessageType::Stage3 => Message::Stage3(reader.forward()?),
        MessageType::Stage1Ack => Message::Stage1Ack(reader.message_id()?),
        MessageType::Stage2Ack => Message::Stage2Ack(reader.message_id()?),
        MessageType::Stage3Ack => Message::Stage3Ack(reader.message_id()?),
        MessageType::Stage3Release => Message::Stage3Release(reader.message_id()?),
        MessageType::RoutingError => {
            if !allow_nested {
                return Err(CanopyError::InvalidData(
                    "nested routing error".into(),
                ));
            }
            let len = reader.u32()? as usize;
            let mut inner = Reader::new(reader.take(len)?);
            let original = decode_envelope(&mut inner, false)?;
            if inner.remaining() != 0 {
                return Err(CanopyError::InvalidData(
                    "trailing bytes in wrapped envelope".into(),
                ));
            }
            Message::RoutingError {
                original: Box::new(original),
            }
        },
        MessageType::Ping => Message::Ping,
        MessageType::Pong => Message::Pong,
        MessageType::Fault => {
            let len = usize::from(reader.u16()?);
            let reason = String::from_utf8_lossy(reader.take(len)?).into_owned();
            Message::Fault { reason }
        },
    };

    Ok(Envelope {
        from,
        to,
        route,
        body,
    })
}

fn put_len_u16(buf: &mut BytesMut, len: usize) -> Result<()> {
    let len = u16::try_from(len)
        .map_err(|_| CanopyError::InvalidData(format!("length {len} exceeds u16")))?;
    buf.put_u16_le(len);
    Ok(())
}

fn put_len_u32(buf: &mut BytesMut, len: usize) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| CanopyError::InvalidData(format!("length {len} exceeds u32")))?;
    buf.put_u32_le(len);
    Ok(())
}

fn put_node(buf: &mut BytesMut, node: &NodeId) {
    let addr = node.addr();
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        },
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        },
    }
    buf.put_u16_le(addr.port());
    buf.put_u64_le(node.joined_at_ms());
}

fn put_optional_node(buf: &mut BytesMut, node: Option<&NodeId>) {
    match node {
        Some(node) => {
            buf.put_u8(1);
            put_node(buf, node);
        },
        None => buf.put_u8(0),
    }
}

fn put_cluster_id(buf: &mut BytesMut, id: &ClusterId) -> Result<()> {
    put_len_u16(buf, id.depth())?;
    for slot in id.path() {
        buf.put_u16_le(*slot);
    }
    Ok(())
}

fn put_view(buf: &mut BytesMut, view: &ClusterView) -> Result<()> {
    put_cluster_id(buf, &view.id)?;
    put_len_u16(buf, view.table.len())?;
    for member in view.table.iter() {
        put_node(buf, member);
    }
    Ok(())
}

fn put_placement(buf: &mut BytesMut, placement: &Placement) -> Result<()> {
    buf.put_u16_le(placement.reliability);
    buf.put_u16_le(placement.fanout);
    put_view(buf, &placement.own)?;
    match &placement.parent {
        Some(parent) => {
            buf.put_u8(1);
            put_view(buf, parent)?;
        },
        None => buf.put_u8(0),
    }
    put_len_u16(buf, placement.children.len())?;
    for child in &placement.children {
        match child {
            Some(view) => {
                buf.put_u8(1);
                put_view(buf, view)?;
            },
            None => buf.put_u8(0),
        }
    }
    Ok(())
}

fn put_message_id(buf: &mut BytesMut, id: &MessageId) {
    put_node(buf, &id.origin);
    buf.put_u64_le(id.seq);
}

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

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                CanopyError::InvalidData(format!(
                    "truncated: need {n} bytes at offset {}, have {}",
                    self.pos,
                    self.remaining()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.take(N)?;
        bytes
            .try_into()
            .map_err(|_| CanopyError::InvalidData("short read".into()))
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn node(&mut self) -> Result<NodeId> {
        let ip = match self.u8()? {
            4 => IpAddr::V4(Ipv4Addr::from(self.array::<4>()?)),
            6 => IpAddr::V6(Ipv6Addr::from(self.array::<16>()?)),
            other => {
                return Err(CanopyError::InvalidData(format!("bad address family {other}")));
            },
        };
        let port = self.u16()?;
        let joined_at_ms = self.u64()?;
        Ok(NodeId::new(SocketAddr::new(ip, port), joined_at_ms))
    }

    fn optional_node(&mut self) -> Result<Option<NodeId>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.node()?)),
            other => Err(CanopyError::InvalidData(format!("bad option flag {other}"))),
        }
    }

    fn cluster_id(&mut self) -> Result<ClusterId> {
        let depth = usize::from(self.u16()?);
        let mut path = Vec::with_capacity(depth.min(64));
        for _ in 0..depth {
            path.push(self.u16()?);
        }
        Ok(ClusterId::from_path(path))
    }

    fn view(&mut self) -> Result<ClusterView> {
        let id = self.cluster_id()?;
        let count = usize::from(self.u16()?);
        let mut members = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            members.push(self.node()?);
        }
        Ok(ClusterView::new(id, ClusterTable::from_chronology(members)))
    }

    fn optional_view(&mut self) -> Result<Option<ClusterView>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.view()?)),
            other => Err(CanopyError::InvalidData(format!("bad option flag {other}"))),
        }
    }

    fn placement(&mut self) -> Result<Placement> {
        let reliability = self.u16()?;
        let fanout = self.u16()?;
        let own = self.view()?;
        let parent = self.optional_view()?;
        let count = usize::from(self.u16()?);
        if count > usize::from(fanout) {
            return Err(CanopyError::InvalidData(format!(
                "{count} child views exceed fanout {fanout}"
            )));
        }
        let mut children = Vec::with_capacity(count);
        for _ in 0..count {
            children.push(self.optional_view()?);
        }
        Ok(Placement {
            reliability,
            fanout,
            own,
            parent,
            children,
        })
    }

    fn message_id(&mut self) -> Result<MessageId> {
        let origin = self.node()?;
        let seq = self.u64()?;
        Ok(MessageId::new(origin, seq))
    }

    fn forward(&mut self) -> Result<Forward> {
        let id = self.message_id()?;
        let raw_kind = self.u8()?;
        let kind = DeliveryKind::from_u8(raw_kind)
            .ok_or_else(|| CanopyError::InvalidData(format!("bad delivery kind {raw_kind}")))?;
        let len = self.u32()? as usize;
        let payload = Bytes::copy_from_slice(self.take(len)?);
        Ok(Forward { id, kind, payload })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn node(port: u16) -> NodeId {
        NodeId::new(SocketAddr::from(([10, 0, 0, 1], port)), 1_700_000_000_000 + u64::from(port))
    }

    fn placement() -> Placement {
        let own = ClusterId::root().child(1);
        Placement {
            reliability: 2,
            fanout: 2,
            own: ClusterView::new(own.clone(), ClusterTable::from_chronology([node(3), node(4)])),
            parent: Some(ClusterView::new(
                ClusterId::root(),
                ClusterTable::from_chronology([node(1), node(2)]),
            )),
            children: vec![
                None,
                Some(ClusterView::new(own.child(1), ClusterTable::new(node(5)))),
            ],
        }
    }

    #[test]
    fn test_join_ack_roundtrip() {
        let envelope = Envelope::direct(
            node(1),
            node(9),
            Message::JoinAck {
                placement: placement(),
            },
        );
        let encoded = OverlayCodec::encode(&envelope).unwrap();
        assert_eq!(OverlayCodec::decode(&encoded).unwrap(), envelope);
    }

    #[test]
    fn test_stage2_with_route_roundtrip() {
        let envelope = Envelope::routed(
            node(1),
            node(3),
            Route {
                from: ClusterId::root(),
                to: ClusterId::root().child(1),
            },
            Message::Stage2(Forward {
                id: MessageId::new(node(7), 42),
                kind: DeliveryKind::Broadcast,
                payload: Bytes::from_static(b"payload"),
            }),
        );
        let encoded = OverlayCodec::encode(&envelope).unwrap();
        assert_eq!(OverlayCodec::decode(&encoded).unwrap(), envelope);
    }

    #[test]
    fn test_routing_error_wraps_original() {
        let original = Envelope::routed(
            node(4),
            node(3),
            Route {
                from: ClusterId::root().child(0),
                to: ClusterId::root().child(0),
            },
            Message::Stage1(Forward {
                id: MessageId::new(node(4), 1),
                kind: DeliveryKind::ToRoot,
                payload: Bytes::from_static(b"up"),
            }),
        );
        let bounced = original.clone().bounce(node(3));
        let decoded = OverlayCodec::decode(&OverlayCodec::encode(&bounced).unwrap()).unwrap();

        assert_eq!(decoded.to, node(4));
        match decoded.body {
            Message::RoutingError { original: inner } => assert_eq!(*inner, original),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_ipv6_node() {
        let v6 = NodeId::new("[::1]:7000".parse().unwrap(), 5);
        let envelope = Envelope::direct(v6, node(1), Message::LeaderNotice { failed: v6 });
        let decoded = OverlayCodec::decode(&OverlayCodec::encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_rejects_unknown_type() {
        let mut encoded = OverlayCodec::encode(&Envelope::direct(node(1), node(2), Message::Ping))
            .unwrap()
            .to_vec();
        encoded[1] = 0xEE;
        assert!(matches!(
            OverlayCodec::decode(&encoded),
            Err(CanopyError::UnknownMessageType(0xEE))
        ));
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut encoded = OverlayCodec::encode(&Envelope::direct(node(1), node(2), Message::Pong))
            .unwrap()
            .to_vec();
        encoded[0] = PROTOCOL_VERSION + 1;
        assert!(matches!(
            OverlayCodec::decode(&encoded),
            Err(CanopyError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_rejects_truncated_and_trailing() {
        let encoded = OverlayCodec::encode(&Envelope::direct(
            node(1),
            node(2),
            Message::Fault {
                reason: "bad frame".into(),
            },
        ))
        .unwrap();

        assert!(OverlayCodec::decode(&encoded[..encoded.len() - 1]).is_err());

        let mut padded = encoded.to_vec();
        padded.push(0);
        assert!(matches!(
            OverlayCodec::decode(&padded),
            Err(CanopyError::InvalidData(_))
        ));
    }
}
