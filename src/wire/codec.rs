//! Wire framing: a fixed-format handshake preamble, followed by
//! length-prefixed, tagged binary messages for the remainder of the
//! connection.
//!
//! Every in-protocol message (everything but the handshake) is framed as a
//! 4 byte big-endian length (counting the tag byte and payload, not the
//! length field itself), a single tag byte identifying the message, and the
//! tag-specific payload. A length of zero is a keep-alive with no tag.

use std::convert::TryInto;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::{BlockIndex, Bitfield, PeerId, Sha1Hash};

/// Identifies this implementation's wire dialect during the handshake. Two
/// peers speaking different protocol strings don't interoperate.
pub const PROTOCOL_STRING: &[u8] = b"blockswarm/1";

const MAX_MESSAGE_LEN: u32 = 1024 * 1024;

/// The first thing sent and received on every connection, before any
/// [`Message`] is exchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// The descriptor identity both sides must agree on to swarm together.
    pub descriptor_hash: Sha1Hash,
    /// The sender's peer id.
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(descriptor_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self {
            descriptor_hash,
            peer_id,
        }
    }
}

/// A protocol message exchanged after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(BlockIndex),
    Bitfield(Bitfield),
    Request(BlockIndex),
    Piece(BlockIndex, Vec<u8>),
}

impl Message {
    fn tag(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request(_) => Some(6),
            Message::Piece(..) => Some(7),
        }
    }
}

/// The codec used for the single handshake exchange at the start of a
/// connection, before switching to [`PeerCodec`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(1 + PROTOCOL_STRING.len() + 20 + 20);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&handshake.descriptor_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }
        let prot_len = buf[0] as usize;
        let total = 1 + prot_len + 20 + 20;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        let mut buf = buf.split_to(total);
        buf.advance(1);
        let prot = buf.split_to(prot_len);
        if prot != PROTOCOL_STRING {
            return Err(Error::ProtocolViolation(
                "unrecognized protocol string in handshake".into(),
            ));
        }
        let mut descriptor_hash = [0u8; 20];
        descriptor_hash.copy_from_slice(&buf[..20]);
        buf.advance(20);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[..20]);

        Ok(Some(Handshake {
            descriptor_hash,
            peer_id,
        }))
    }
}

/// The codec used for the remainder of a connection, after the handshake.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        let tag = match msg.tag() {
            None => {
                buf.put_u32(0);
                return Ok(());
            }
            Some(tag) => tag,
        };

        match &msg {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(tag);
            }
            Message::Have(index) => {
                buf.put_u32(1 + 8);
                buf.put_u8(tag);
                buf.put_u64(*index as u64);
            }
            Message::Bitfield(bitfield) => {
                let packed = pack_bitfield(bitfield);
                buf.put_u32(1 + packed.len() as u32);
                buf.put_u8(tag);
                buf.put_slice(&packed);
            }
            Message::Request(index) => {
                buf.put_u32(1 + 8);
                buf.put_u8(tag);
                buf.put_u64(*index as u64);
            }
            Message::Piece(index, data) => {
                buf.put_u32(1 + 8 + data.len() as u32);
                buf.put_u8(tag);
                buf.put_u64(*index as u64);
                buf.put_slice(data);
            }
            Message::KeepAlive => unreachable!("keep-alive has no tag"),
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if len > MAX_MESSAGE_LEN {
            return Err(Error::ProtocolViolation(format!(
                "message length {} exceeds maximum {}",
                len, MAX_MESSAGE_LEN
            )));
        }
        if buf.len() < 4 + len as usize {
            buf.reserve(4 + len as usize - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let mut body = buf.split_to(len as usize);
        let tag = body[0];
        body.advance(1);

        let msg = match tag {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if body.len() != 8 {
                    return Err(Error::ProtocolViolation("malformed have message".into()));
                }
                Message::Have(u64::from_be_bytes(body[..8].try_into().unwrap()) as BlockIndex)
            }
            5 => Message::Bitfield(unpack_bitfield(&body)),
            6 => {
                if body.len() != 8 {
                    return Err(Error::ProtocolViolation("malformed request message".into()));
                }
                Message::Request(u64::from_be_bytes(body[..8].try_into().unwrap()) as BlockIndex)
            }
            7 => {
                if body.len() < 8 {
                    return Err(Error::ProtocolViolation("malformed piece message".into()));
                }
                let index = u64::from_be_bytes(body[..8].try_into().unwrap()) as BlockIndex;
                let data = body[8..].to_vec();
                Message::Piece(index, data)
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unrecognized message tag {}",
                    other
                )))
            }
        };
        Ok(Some(msg))
    }
}

/// Packs a bitfield most-significant-bit first within each byte, matching
/// [`crate::Bitfield`]'s documented wire order.
fn pack_bitfield(bitfield: &Bitfield) -> Vec<u8> {
    let mut bytes = vec![0u8; (bitfield.len() + 7) / 8];
    for (i, bit) in bitfield.iter().enumerate() {
        if *bit {
            bytes[i / 8] |= 1 << (7 - (i % 8));
        }
    }
    bytes
}

fn unpack_bitfield(bytes: &[u8]) -> Bitfield {
    Bitfield::from_vec(bytes.to_vec())
}
