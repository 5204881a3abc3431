//! Wire format of the club protocol.
//!
//! Every reliable frame is one type byte followed by the typed body; every
//! body starts with the [`Header`]. Integers are big-endian, identifier sets
//! and payloads are length-prefixed with a `u32`. The layout is hand-rolled:
//! it is small, fixed by the protocol, and shared buffers are cheaper when we
//! control the bytes ourselves.

use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::id::{MemberId, MessageId, TimeStamp};

/// Sole compatibility gate of the fusion handshake (§preamble).
pub const PROTOCOL_VERSION: u32 = 1;

const TYPE_FUSE: u8 = 1;
const TYPE_PORT_OFFER: u8 = 2;
const TYPE_USER_DATA: u8 = 3;
const TYPE_ACK: u8 = 4;

/// Decoding failures. Fatal for the socket the frame arrived on, never for
/// the hub.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,

    #[error("unknown message type {0}")]
    UnknownType(u8),
}

/// Common prefix of every protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub originator: MemberId,
    pub time_stamp: TimeStamp,
    /// Id of the configuration installed when the message was composed.
    pub config_id: MessageId,
    /// Every member that has seen-and-forwarded this frame, the originator
    /// included from the moment of creation.
    pub visited: BTreeSet<MemberId>,
}

impl Header {
    /// The message id this header defines.
    pub fn id(&self) -> MessageId {
        MessageId::new(self.time_stamp, self.originator)
    }
}

/// The vote a member casts for one ackable message.
///
/// `neighbors` is the voter's connected set at the time of voting; the
/// originator's own copy doubles as the quorum of the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckData {
    pub message_id: MessageId,
    pub predecessor_id: MessageId,
    pub neighbors: BTreeSet<MemberId>,
}

/// Membership change: the originator's connection set towards `target`
/// changed (a join after a successful handshake, or a lost peer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fuse {
    pub header: Header,
    pub ack: AckData,
    pub target: MemberId,
}

/// Application payload awaiting total ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserData {
    pub header: Header,
    pub ack: AckData,
    pub payload: Vec<u8>,
}

/// NAT traversal hint. Not ackable, never logged; the port numbers are
/// recorded on the originator's node when we are the addressee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOffer {
    pub header: Header,
    pub addressor: MemberId,
    pub internal_port: u16,
    pub external_port: u16,
}

/// A vote cast on behalf of the originator for one prior message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub header: Header,
    pub ack: AckData,
}

/// Every frame that travels the reliable gossip overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Fuse(Fuse),
    PortOffer(PortOffer),
    UserData(UserData),
    Ack(Ack),
}

impl Message {
    pub fn header(&self) -> &Header {
        match self {
            Message::Fuse(m) => &m.header,
            Message::PortOffer(m) => &m.header,
            Message::UserData(m) => &m.header,
            Message::Ack(m) => &m.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut Header {
        match self {
            Message::Fuse(m) => &mut m.header,
            Message::PortOffer(m) => &mut m.header,
            Message::UserData(m) => &mut m.header,
            Message::Ack(m) => &mut m.header,
        }
    }

    pub fn id(&self) -> MessageId {
        self.header().id()
    }

    pub fn originator(&self) -> MemberId {
        self.header().originator
    }

    /// Encode into a single shareable buffer: type byte, then body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        match self {
            Message::Fuse(m) => {
                buf.put_u8(TYPE_FUSE);
                put_header(&mut buf, &m.header);
                put_ack_data(&mut buf, &m.ack);
                put_member_id(&mut buf, m.target);
            }
            Message::PortOffer(m) => {
                buf.put_u8(TYPE_PORT_OFFER);
                put_header(&mut buf, &m.header);
                put_member_id(&mut buf, m.addressor);
                buf.put_u16(m.internal_port);
                buf.put_u16(m.external_port);
            }
            Message::UserData(m) => {
                buf.put_u8(TYPE_USER_DATA);
                put_header(&mut buf, &m.header);
                put_ack_data(&mut buf, &m.ack);
                buf.put_u32(m.payload.len() as u32);
                buf.put_slice(&m.payload);
            }
            Message::Ack(m) => {
                buf.put_u8(TYPE_ACK);
                put_header(&mut buf, &m.header);
                put_ack_data(&mut buf, &m.ack);
            }
        }
        buf.freeze()
    }

    /// Decode one frame.
    pub fn decode(frame: &[u8]) -> Result<Message, WireError> {
        let mut cur = Cursor(frame);
        let tag = cur.u8()?;
        let header = cur.header()?;
        let msg = match tag {
            TYPE_FUSE => Message::Fuse(Fuse {
                header,
                ack: cur.ack_data()?,
                target: cur.member_id()?,
            }),
            TYPE_PORT_OFFER => Message::PortOffer(PortOffer {
                header,
                addressor: cur.member_id()?,
                internal_port: cur.u16()?,
                external_port: cur.u16()?,
            }),
            TYPE_USER_DATA => Message::UserData(UserData {
                header,
                ack: cur.ack_data()?,
                payload: cur.blob()?,
            }),
            TYPE_ACK => Message::Ack(Ack {
                header,
                ack: cur.ack_data()?,
            }),
            other => return Err(WireError::UnknownType(other)),
        };
        Ok(msg)
    }
}

/// Handshake preamble: protocol version, then our identity.
pub fn encode_preamble(id: MemberId) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + 16);
    buf.put_u32(PROTOCOL_VERSION);
    put_member_id(&mut buf, id);
    buf.freeze()
}

pub fn decode_preamble(frame: &[u8]) -> Result<(u32, MemberId), WireError> {
    let mut cur = Cursor(frame);
    let version = cur.u32()?;
    let id = cur.member_id()?;
    Ok((version, id))
}

/// Unreliable frame: the original source, then the payload.
pub fn encode_unreliable(source: MemberId, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + 4 + payload.len());
    put_member_id(&mut buf, source);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn decode_unreliable(frame: &[u8]) -> Result<(MemberId, &[u8]), WireError> {
    let mut cur = Cursor(frame);
    let source = cur.member_id()?;
    let payload = cur.slice()?;
    Ok((source, payload))
}

// ── encoding helpers ─────────────────────────────────────────────────

fn put_member_id(buf: &mut BytesMut, id: MemberId) {
    buf.put_slice(id.as_bytes());
}

fn put_message_id(buf: &mut BytesMut, id: MessageId) {
    buf.put_u64(id.time_stamp);
    put_member_id(buf, id.originator);
}

fn put_id_set(buf: &mut BytesMut, ids: &BTreeSet<MemberId>) {
    buf.put_u32(ids.len() as u32);
    for id in ids {
        put_member_id(buf, *id);
    }
}

fn put_header(buf: &mut BytesMut, header: &Header) {
    put_member_id(buf, header.originator);
    buf.put_u64(header.time_stamp);
    put_message_id(buf, header.config_id);
    put_id_set(buf, &header.visited);
}

fn put_ack_data(buf: &mut BytesMut, ack: &AckData) {
    put_message_id(buf, ack.message_id);
    put_message_id(buf, ack.predecessor_id);
    put_id_set(buf, &ack.neighbors);
}

// ── decoding cursor ──────────────────────────────────────────────────

struct Cursor<'a>(&'a [u8]);

impl<'a> Cursor<'a> {
    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.0.remaining() < n {
            return Err(WireError::Truncated);
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.0.get_u8())
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        Ok(self.0.get_u16())
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.0.get_u32())
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        Ok(self.0.get_u64())
    }

    fn member_id(&mut self) -> Result<MemberId, WireError> {
        self.need(16)?;
        let mut bytes = [0u8; 16];
        self.0.copy_to_slice(&mut bytes);
        Ok(MemberId::from_bytes(bytes))
    }

    fn message_id(&mut self) -> Result<MessageId, WireError> {
        let time_stamp = self.u64()?;
        let originator = self.member_id()?;
        Ok(MessageId::new(time_stamp, originator))
    }

    fn id_set(&mut self) -> Result<BTreeSet<MemberId>, WireError> {
        let len = self.u32()? as usize;
        self.need(len * 16)?;
        let mut ids = BTreeSet::new();
        for _ in 0..len {
            ids.insert(self.member_id()?);
        }
        Ok(ids)
    }

    fn slice(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let (head, tail) = self.0.split_at(len);
        self.0 = tail;
        Ok(head)
    }

    fn blob(&mut self) -> Result<Vec<u8>, WireError> {
        Ok(self.slice()?.to_vec())
    }

    fn header(&mut self) -> Result<Header, WireError> {
        Ok(Header {
            originator: self.member_id()?,
            time_stamp: self.u64()?,
            config_id: self.message_id()?,
            visited: self.id_set()?,
        })
    }

    fn ack_data(&mut self) -> Result<AckData, WireError> {
        Ok(AckData {
            message_id: self.message_id()?,
            predecessor_id: self.message_id()?,
            neighbors: self.id_set()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(n: u128) -> MemberId {
        MemberId::from_bytes(n.to_be_bytes())
    }

    fn header(n: u128, ts: TimeStamp) -> Header {
        Header {
            originator: member(n),
            time_stamp: ts,
            config_id: MessageId::new(1, member(7)),
            visited: [member(n), member(9)].into(),
        }
    }

    fn ack_data(n: u128, ts: TimeStamp) -> AckData {
        AckData {
            message_id: MessageId::new(ts, member(n)),
            predecessor_id: MessageId::new(2, member(7)),
            neighbors: [member(n), member(7), member(9)].into(),
        }
    }

    #[test]
    fn fuse_roundtrip() {
        let msg = Message::Fuse(Fuse {
            header: header(3, 5),
            ack: ack_data(3, 5),
            target: member(11),
        });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn user_data_roundtrip() {
        let msg = Message::UserData(UserData {
            header: header(3, 6),
            ack: ack_data(3, 6),
            payload: b"payload bytes".to_vec(),
        });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let msg = Message::UserData(UserData {
            header: header(3, 6),
            ack: ack_data(3, 6),
            payload: Vec::new(),
        });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn port_offer_roundtrip() {
        let msg = Message::PortOffer(PortOffer {
            header: header(4, 9),
            addressor: member(2),
            internal_port: 6000,
            external_port: 32000,
        });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn ack_roundtrip() {
        let msg = Message::Ack(Ack {
            header: header(5, 12),
            ack: ack_data(3, 5),
        });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn unknown_type_rejected() {
        let msg = Message::Ack(Ack {
            header: header(5, 12),
            ack: ack_data(3, 5),
        });
        let mut bytes = msg.encode().to_vec();
        bytes[0] = 200;
        assert_eq!(Message::decode(&bytes), Err(WireError::UnknownType(200)));
    }

    #[test]
    fn truncation_rejected_at_every_length() {
        let msg = Message::UserData(UserData {
            header: header(3, 6),
            ack: ack_data(3, 6),
            payload: b"xyz".to_vec(),
        });
        let bytes = msg.encode();
        for cut in 0..bytes.len() {
            assert_eq!(
                Message::decode(&bytes[..cut]),
                Err(WireError::Truncated),
                "prefix of {cut} bytes should not decode"
            );
        }
    }

    #[test]
    fn oversized_set_length_is_truncation_not_allocation() {
        let mut bytes = BytesMut::new();
        bytes.put_u8(4); // ack
        // header with a visited length claiming far more than the frame holds
        bytes.put_slice(member(1).as_bytes());
        bytes.put_u64(1);
        bytes.put_u64(0);
        bytes.put_slice(member(0).as_bytes());
        bytes.put_u32(u32::MAX);
        assert_eq!(Message::decode(&bytes), Err(WireError::Truncated));
    }

    #[test]
    fn preamble_roundtrip() {
        let id = member(42);
        let bytes = encode_preamble(id);
        assert_eq!(decode_preamble(&bytes).unwrap(), (PROTOCOL_VERSION, id));
    }

    #[test]
    fn unreliable_roundtrip() {
        let bytes = encode_unreliable(member(3), b"blip");
        let (source, payload) = decode_unreliable(&bytes).unwrap();
        assert_eq!(source, member(3));
        assert_eq!(payload, b"blip");
    }
}
