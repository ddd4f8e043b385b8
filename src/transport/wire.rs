//! Datagram framing.
//!
//! ## Wire Format
//! ```text
//! [PeerId(2)] [Channel(1)] [Flags(1)] [Seq(2)?] [SplitId(2) Count(2) Index(2)?] [Body(N)]
//! ```
//! `Seq` is present for reliable and ack packets; the split sub-header only
//! on split data chunks. Control traffic (hello, hello-ack, ping,
//! disconnect) rides this layer directly and never reaches the codec.

use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Independent ordered delivery lanes per connection
pub const NUM_CHANNELS: u8 = 3;

/// Sequence numbers wrap at this modulus; comparisons use the half-range rule
pub const SEQ_MODULUS: u32 = 65_536;

const FLAG_RELIABLE: u8 = 0x01;
const FLAG_SPLIT: u8 = 0x02;
const FLAG_ACK: u8 = 0x04;
const FLAG_CONTROL: u8 = 0x08;

const CTRL_HELLO: u8 = 0x00;
const CTRL_HELLO_ACK: u8 = 0x01;
const CTRL_PING: u8 = 0x02;
const CTRL_DISCONNECT: u8 = 0x03;

/// `true` iff `a` precedes `b` in wrapping sequence order
pub fn seq_before(a: u16, b: u16) -> bool {
    a != b && b.wrapping_sub(a) < (SEQ_MODULUS / 2) as u16
}

/// Sub-header present on each chunk of a split payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitHeader {
    pub split_id: u16,
    pub chunk_count: u16,
    pub chunk_index: u16,
}

/// Connection-management messages handled below the codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    /// Client's opening offer of supported version ranges
    Hello {
        serialize_min: u8,
        serialize_max: u8,
        protocol_min: u16,
        protocol_max: u16,
    },
    /// Server's assignment of a peer id and the negotiated versions
    HelloAck {
        peer_id: u16,
        serialize_ver: u8,
        protocol_ver: u16,
    },
    Ping,
    Disconnect,
}

/// Packet body after the common header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    /// Codec-coded bytes (possibly one chunk of a split payload)
    Data(Bytes),
    /// Acknowledgment of the reliable packet carrying `seq`
    Ack,
    Control(ControlMsg),
}

/// The on-the-wire unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePacket {
    pub peer_id: u16,
    pub channel: u8,
    pub reliable: bool,
    /// Meaningful when `reliable` or the body is an ack
    pub seq: u16,
    pub split: Option<SplitHeader>,
    pub body: PacketBody,
}

impl WirePacket {
    pub fn data(peer_id: u16, channel: u8, reliable: bool, seq: u16, payload: Bytes) -> Self {
        Self {
            peer_id,
            channel,
            reliable,
            seq,
            split: None,
            body: PacketBody::Data(payload),
        }
    }

    pub fn ack(peer_id: u16, channel: u8, seq: u16) -> Self {
        Self {
            peer_id,
            channel,
            reliable: false,
            seq,
            split: None,
            body: PacketBody::Ack,
        }
    }

    pub fn control(peer_id: u16, msg: ControlMsg) -> Self {
        Self {
            peer_id,
            channel: 0,
            reliable: false,
            seq: 0,
            split: None,
            body: PacketBody::Control(msg),
        }
    }

    /// Serialize to a datagram
    pub fn encode(&self) -> Bytes {
        let mut flags = 0u8;
        if self.reliable {
            flags |= FLAG_RELIABLE;
        }
        if self.split.is_some() {
            flags |= FLAG_SPLIT;
        }
        match self.body {
            PacketBody::Ack => flags |= FLAG_ACK,
            PacketBody::Control(_) => flags |= FLAG_CONTROL,
            PacketBody::Data(_) => {}
        }

        let mut buf = BytesMut::with_capacity(16);
        buf.put_u16(self.peer_id);
        buf.put_u8(self.channel);
        buf.put_u8(flags);
        if self.reliable || matches!(self.body, PacketBody::Ack) {
            buf.put_u16(self.seq);
        }
        if let Some(split) = self.split {
            buf.put_u16(split.split_id);
            buf.put_u16(split.chunk_count);
            buf.put_u16(split.chunk_index);
        }
        match &self.body {
            PacketBody::Data(payload) => buf.put_slice(payload),
            PacketBody::Ack => {}
            PacketBody::Control(msg) => encode_control(&mut buf, msg),
        }
        buf.freeze()
    }

    /// Parse a received datagram
    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        if bytes.remaining() < 4 {
            return Err(ProtocolError::MalformedPacket(
                "datagram shorter than header".into(),
            ));
        }
        let peer_id = bytes.get_u16();
        let channel = bytes.get_u8();
        let flags = bytes.get_u8();

        if channel >= NUM_CHANNELS {
            return Err(ProtocolError::MalformedPacket(format!(
                "channel {channel} out of range"
            )));
        }

        let reliable = flags & FLAG_RELIABLE != 0;
        let is_ack = flags & FLAG_ACK != 0;
        let is_control = flags & FLAG_CONTROL != 0;
        let is_split = flags & FLAG_SPLIT != 0;

        if is_ack && is_control {
            return Err(ProtocolError::MalformedPacket(
                "ack and control flags both set".into(),
            ));
        }
        if is_split && (is_ack || is_control) {
            return Err(ProtocolError::MalformedPacket(
                "split flag on a non-data packet".into(),
            ));
        }

        let seq = if reliable || is_ack {
            if bytes.remaining() < 2 {
                return Err(ProtocolError::MalformedPacket("truncated sequence".into()));
            }
            bytes.get_u16()
        } else {
            0
        };

        let split = if is_split {
            if bytes.remaining() < 6 {
                return Err(ProtocolError::MalformedPacket(
                    "truncated split sub-header".into(),
                ));
            }
            let header = SplitHeader {
                split_id: bytes.get_u16(),
                chunk_count: bytes.get_u16(),
                chunk_index: bytes.get_u16(),
            };
            if header.chunk_count == 0 || header.chunk_index >= header.chunk_count {
                return Err(ProtocolError::MalformedPacket(format!(
                    "split chunk {}/{} out of range",
                    header.chunk_index, header.chunk_count
                )));
            }
            Some(header)
        } else {
            None
        };

        let body = if is_ack {
            if !bytes.is_empty() {
                return Err(ProtocolError::MalformedPacket("ack carries payload".into()));
            }
            PacketBody::Ack
        } else if is_control {
            PacketBody::Control(decode_control(&mut bytes)?)
        } else {
            PacketBody::Data(bytes)
        };

        Ok(Self {
            peer_id,
            channel,
            reliable,
            seq,
            split,
            body,
        })
    }
}

fn encode_control(buf: &mut BytesMut, msg: &ControlMsg) {
    match msg {
        ControlMsg::Hello {
            serialize_min,
            serialize_max,
            protocol_min,
            protocol_max,
        } => {
            buf.put_u8(CTRL_HELLO);
            buf.put_u8(*serialize_min);
            buf.put_u8(*serialize_max);
            buf.put_u16(*protocol_min);
            buf.put_u16(*protocol_max);
        }
        ControlMsg::HelloAck {
            peer_id,
            serialize_ver,
            protocol_ver,
        } => {
            buf.put_u8(CTRL_HELLO_ACK);
            buf.put_u16(*peer_id);
            buf.put_u8(*serialize_ver);
            buf.put_u16(*protocol_ver);
        }
        ControlMsg::Ping => buf.put_u8(CTRL_PING),
        ControlMsg::Disconnect => buf.put_u8(CTRL_DISCONNECT),
    }
}

fn decode_control(bytes: &mut Bytes) -> Result<ControlMsg> {
    if bytes.remaining() < 1 {
        return Err(ProtocolError::MalformedPacket("empty control body".into()));
    }
    match bytes.get_u8() {
        CTRL_HELLO => {
            if bytes.remaining() < 6 {
                return Err(ProtocolError::MalformedPacket("truncated hello".into()));
            }
            Ok(ControlMsg::Hello {
                serialize_min: bytes.get_u8(),
                serialize_max: bytes.get_u8(),
                protocol_min: bytes.get_u16(),
                protocol_max: bytes.get_u16(),
            })
        }
        CTRL_HELLO_ACK => {
            if bytes.remaining() < 5 {
                return Err(ProtocolError::MalformedPacket("truncated hello-ack".into()));
            }
            Ok(ControlMsg::HelloAck {
                peer_id: bytes.get_u16(),
                serialize_ver: bytes.get_u8(),
                protocol_ver: bytes.get_u16(),
            })
        }
        CTRL_PING => Ok(ControlMsg::Ping),
        CTRL_DISCONNECT => Ok(ControlMsg::Disconnect),
        other => Err(ProtocolError::MalformedPacket(format!(
            "unknown control type {other}"
        ))),
    }
}
