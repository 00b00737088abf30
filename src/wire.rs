//! # Wire Protocol
//!
//! This module defines the byte-level protocol spoken between overlay nodes.
//! Every frame starts with a one-byte type tag; all integers are big-endian.
//!
//! | Type | Byte | Payload |
//! |--------------|------|--------------------------------------------------|
//! | JOIN | `J` | 6-byte id |
//! | FORWARDJOIN | `F` | 6-byte id + 1-byte TTL |
//! | JOINREPLY | `R` | 6-byte id |
//! | HNEIGHBOUR | `H` | 6-byte id |
//! | LNEIGHBOUR | `L` | 6-byte id |
//! | ACCEPT | `A` | (empty) |
//! | DECLINE | `D` | (empty) |
//! | DISCONNECT | `X` | (empty) |
//! | SHUFFLE | `S` | 6-byte id + 1-byte TTL + 1-byte len + len×6 ids |
//! | SHUFFLEREPLY | `Y` | 1-byte len + len×6 ids |
//! | MESSAGE | `M` | 4-byte length + payload |
//!
//! Identifiers are `(IPv4, port)` pairs with a canonical 6-byte encoding:
//! the four address octets in network order followed by the port big-endian.
//!
//! Decoding is incremental: [`decode`] drains one complete frame from the
//! front of a [`BytesMut`] buffer and leaves a trailing partial frame in
//! place for the next socket read. MESSAGE payloads are capped at
//! [`MAX_MESSAGE_SIZE`] so a hostile length prefix cannot grow the receive
//! buffer without bound.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use bytes::{Buf, BytesMut};

/// Length of an encoded identifier on the wire.
pub const ID_LEN: usize = 6;

/// Maximum MESSAGE payload accepted from the wire (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum number of identifiers in a SHUFFLE/SHUFFLEREPLY exchange list.
/// The wire carries the length in a single byte.
pub const MAX_XLIST_LEN: usize = u8::MAX as usize;

pub const TYPE_JOIN: u8 = b'J';
pub const TYPE_FORWARD_JOIN: u8 = b'F';
pub const TYPE_JOIN_REPLY: u8 = b'R';
pub const TYPE_HIGH_NEIGHBOUR: u8 = b'H';
pub const TYPE_LOW_NEIGHBOUR: u8 = b'L';
pub const TYPE_ACCEPT: u8 = b'A';
pub const TYPE_DECLINE: u8 = b'D';
pub const TYPE_DISCONNECT: u8 = b'X';
pub const TYPE_SHUFFLE: u8 = b'S';
pub const TYPE_SHUFFLE_REPLY: u8 = b'Y';
pub const TYPE_MESSAGE: u8 = b'M';

/// Overlay node identifier: an IPv4 address and the TCP port the node
/// listens on. Equality is bytewise; the ordering matches the ordering of
/// the 6-byte wire encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    addr: Ipv4Addr,
    port: u16,
}

impl NodeId {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The socket address this identifier names.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.addr, self.port))
    }

    /// Canonical 6-byte wire encoding.
    pub fn encode(&self) -> [u8; ID_LEN] {
        let o = self.addr.octets();
        let p = self.port.to_be_bytes();
        [o[0], o[1], o[2], o[3], p[0], p[1]]
    }

    /// Decode from exactly [`ID_LEN`] bytes. Callers guarantee the length.
    pub fn decode(bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), ID_LEN);
        Self {
            addr: Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]),
            port: u16::from_be_bytes([bytes[4], bytes[5]]),
        }
    }
}

impl From<SocketAddrV4> for NodeId {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl FromStr for NodeId {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddrV4>().map(Self::from)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}:{})", self.addr, self.port)
    }
}

/// Priority of a neighbour request. High-priority requests are always
/// accepted; low-priority requests are accepted only while the active view
/// has room.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

/// A decoded protocol frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Join(NodeId),
    ForwardJoin { new: NodeId, ttl: u8 },
    JoinReply(NodeId),
    Neighbour { id: NodeId, priority: Priority },
    Accept,
    Decline,
    Disconnect,
    Shuffle { requester: NodeId, ttl: u8, xlist: Vec<NodeId> },
    ShuffleReply { xlist: Vec<NodeId> },
    Message(Vec<u8>),
}

/// Protocol-level decode failures. Fatal for the connection they occur on.
#[derive(Debug)]
pub enum WireError {
    /// The first byte of a frame is not a known type tag.
    UnknownType(u8),
    /// A MESSAGE length prefix exceeds [`MAX_MESSAGE_SIZE`].
    MessageTooLarge(usize),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::UnknownType(byte) => write!(f, "unknown frame type byte 0x{byte:02x}"),
            WireError::MessageTooLarge(len) => {
                write!(f, "message of {len} bytes exceeds limit of {MAX_MESSAGE_SIZE}")
            }
        }
    }
}

impl std::error::Error for WireError {}

impl Frame {
    /// Encode this frame into its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Join(id) => encode_id_frame(TYPE_JOIN, id),
            Frame::JoinReply(id) => encode_id_frame(TYPE_JOIN_REPLY, id),
            Frame::ForwardJoin { new, ttl } => {
                let mut buf = encode_id_frame(TYPE_FORWARD_JOIN, new);
                buf.push(*ttl);
                buf
            }
            Frame::Neighbour { id, priority } => {
                let tag = match priority {
                    Priority::High => TYPE_HIGH_NEIGHBOUR,
                    Priority::Low => TYPE_LOW_NEIGHBOUR,
                };
                encode_id_frame(tag, id)
            }
            Frame::Accept => vec![TYPE_ACCEPT],
            Frame::Decline => vec![TYPE_DECLINE],
            Frame::Disconnect => vec![TYPE_DISCONNECT],
            Frame::Shuffle { requester, ttl, xlist } => {
                debug_assert!(xlist.len() <= MAX_XLIST_LEN);
                let mut buf = Vec::with_capacity(1 + ID_LEN + 2 + xlist.len() * ID_LEN);
                buf.push(TYPE_SHUFFLE);
                buf.extend_from_slice(&requester.encode());
                buf.push(*ttl);
                buf.push(xlist.len() as u8);
                for id in xlist {
                    buf.extend_from_slice(&id.encode());
                }
                buf
            }
            Frame::ShuffleReply { xlist } => {
                debug_assert!(xlist.len() <= MAX_XLIST_LEN);
                let mut buf = Vec::with_capacity(2 + xlist.len() * ID_LEN);
                buf.push(TYPE_SHUFFLE_REPLY);
                buf.push(xlist.len() as u8);
                for id in xlist {
                    buf.extend_from_slice(&id.encode());
                }
                buf
            }
            Frame::Message(payload) => {
                let mut buf = Vec::with_capacity(5 + payload.len());
                buf.push(TYPE_MESSAGE);
                buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                buf.extend_from_slice(payload);
                buf
            }
        }
    }
}

fn encode_id_frame(tag: u8, id: &NodeId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + ID_LEN);
    buf.push(tag);
    buf.extend_from_slice(&id.encode());
    buf
}

/// Drain one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds no frame or only a partial one;
/// the partial bytes stay in place for the next read. Consumed bytes are
/// advanced past on success.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let tag = buf[0];
    match tag {
        TYPE_JOIN | TYPE_JOIN_REPLY | TYPE_HIGH_NEIGHBOUR | TYPE_LOW_NEIGHBOUR => {
            if buf.len() < 1 + ID_LEN {
                return Ok(None);
            }
            let id = NodeId::decode(&buf[1..1 + ID_LEN]);
            buf.advance(1 + ID_LEN);
            Ok(Some(match tag {
                TYPE_JOIN => Frame::Join(id),
                TYPE_JOIN_REPLY => Frame::JoinReply(id),
                TYPE_HIGH_NEIGHBOUR => Frame::Neighbour { id, priority: Priority::High },
                _ => Frame::Neighbour { id, priority: Priority::Low },
            }))
        }
        TYPE_FORWARD_JOIN => {
            if buf.len() < 1 + ID_LEN + 1 {
                return Ok(None);
            }
            let new = NodeId::decode(&buf[1..1 + ID_LEN]);
            let ttl = buf[1 + ID_LEN];
            buf.advance(1 + ID_LEN + 1);
            Ok(Some(Frame::ForwardJoin { new, ttl }))
        }
        TYPE_ACCEPT => {
            buf.advance(1);
            Ok(Some(Frame::Accept))
        }
        TYPE_DECLINE => {
            buf.advance(1);
            Ok(Some(Frame::Decline))
        }
        TYPE_DISCONNECT => {
            buf.advance(1);
            Ok(Some(Frame::Disconnect))
        }
        TYPE_SHUFFLE => {
            // tag + requester + ttl + len
            let header = 1 + ID_LEN + 2;
            if buf.len() < header {
                return Ok(None);
            }
            let len = buf[header - 1] as usize;
            if buf.len() < header + len * ID_LEN {
                return Ok(None);
            }
            let requester = NodeId::decode(&buf[1..1 + ID_LEN]);
            let ttl = buf[1 + ID_LEN];
            let xlist = decode_xlist(&buf[header..], len);
            buf.advance(header + len * ID_LEN);
            Ok(Some(Frame::Shuffle { requester, ttl, xlist }))
        }
        TYPE_SHUFFLE_REPLY => {
            if buf.len() < 2 {
                return Ok(None);
            }
            let len = buf[1] as usize;
            if buf.len() < 2 + len * ID_LEN {
                return Ok(None);
            }
            let xlist = decode_xlist(&buf[2..], len);
            buf.advance(2 + len * ID_LEN);
            Ok(Some(Frame::ShuffleReply { xlist }))
        }
        TYPE_MESSAGE => {
            if buf.len() < 5 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
            if len > MAX_MESSAGE_SIZE {
                return Err(WireError::MessageTooLarge(len));
            }
            if buf.len() < 5 + len {
                return Ok(None);
            }
            let payload = buf[5..5 + len].to_vec();
            buf.advance(5 + len);
            Ok(Some(Frame::Message(payload)))
        }
        other => Err(WireError::UnknownType(other)),
    }
}

fn decode_xlist(bytes: &[u8], len: usize) -> Vec<NodeId> {
    (0..len)
        .map(|i| NodeId::decode(&bytes[i * ID_LEN..(i + 1) * ID_LEN]))
        .collect()
}
