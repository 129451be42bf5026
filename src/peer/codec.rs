//! The peer wire protocol messages and their codecs.
//!
//! Framing over an actual connection (chunked transfers, rate limiting,
//! ciphers) is done by the [`wire`](crate::peer::wire) module; the codecs
//! here only translate between messages and bytes.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    Bitfield, BlockInfo, PeerId, Sha1Hash, BLOCK_LEN,
};

/// The protocol string of the standard BitTorrent handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The length of the full handshake message on the wire.
pub(crate) const HANDSHAKE_LEN: usize = 68;

/// No legitimate message frame is larger than a piece message carrying one
/// block; anything above this is treated as a protocol violation.
pub(crate) const MAX_FRAME_LEN: usize = BLOCK_LEN as usize + 1024;

/// The handshake exchanged right after encryption is negotiated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// The protocol string, which must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Reserved for extensions, currently unused.
    pub reserved: [u8; 8],
    /// The torrent's SHA1 info hash.
    pub info_hash: Sha1Hash,
    /// The peer's arbitrary id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates a handshake with the protocol string set.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(prot.len() as u8);
        buf.put_slice(&prot);
        buf.put_slice(&reserved);
        buf.put_slice(&info_hash);
        buf.put_slice(&peer_id);
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
        if prot_len != PROTOCOL_STRING.len() {
            return Err(Error::InvalidProtocol);
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        buf.advance(1);

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidProtocol);
        }
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id of a message, which is included in all messages except keep-alives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl MessageId {
    fn try_from(id: u8) -> Result<Self> {
        use MessageId::*;
        match id {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Piece),
            8 => Ok(Cancel),
            _ => Err(Error::InvalidMessage),
        }
    }
}

/// A message of the peer wire protocol.
#[derive(Debug, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: usize,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    /// A block of torrent data.
    ///
    /// `len` is the block length the message was created for. For inbound
    /// messages `data` always holds that many bytes; outbound piece messages
    /// sit in the send queue with an empty `data` until the send pump reads
    /// the block from disk into a pool buffer.
    Piece {
        piece_index: usize,
        offset: u32,
        len: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// The id of the message, or `None` for keep-alives.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

pub struct PeerCodec;

impl Encoder<&Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: &Message, buf: &mut BytesMut) -> Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece_index as u32);
            }
            Bitfield(bitfield) => {
                let payload = bitfield.as_raw_slice();
                buf.put_u32(1 + payload.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(payload);
            }
            Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Piece {
                piece_index,
                offset,
                len,
                data,
            } => {
                debug_assert_eq!(data.len(), *len as usize);
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*piece_index as u32);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
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
        let mut header = [0; 4];
        header.copy_from_slice(&buf[..4]);
        let frame_len = u32::from_be_bytes(header) as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge);
        }
        if buf.len() < 4 + frame_len {
            buf.reserve(4 + frame_len - buf.len());
            return Ok(None);
        }
        buf.advance(4);

        if frame_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = MessageId::try_from(buf.get_u8())?;
        let payload_len = frame_len - 1;

        use MessageId::*;
        let msg = match id {
            Choke | Unchoke | Interested | NotInterested => {
                if payload_len != 0 {
                    return Err(Error::InvalidMessage);
                }
                match id {
                    Choke => Message::Choke,
                    Unchoke => Message::Unchoke,
                    Interested => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            Have => {
                if payload_len != 4 {
                    return Err(Error::InvalidMessage);
                }
                Message::Have {
                    piece_index: buf.get_u32() as usize,
                }
            }
            Bitfield => {
                let payload = buf.split_to(payload_len);
                Message::Bitfield(crate::Bitfield::from_slice(&payload))
            }
            Request | Cancel => {
                if payload_len != 12 {
                    return Err(Error::InvalidMessage);
                }
                let block = BlockInfo {
                    piece_index: buf.get_u32() as usize,
                    offset: buf.get_u32(),
                    len: buf.get_u32(),
                };
                if id == Request {
                    Message::Request(block)
                } else {
                    Message::Cancel(block)
                }
            }
            Piece => {
                if payload_len < 8 {
                    return Err(Error::InvalidMessage);
                }
                let piece_index = buf.get_u32() as usize;
                let offset = buf.get_u32();
                let data = buf.split_to(payload_len - 8).to_vec();
                Message::Piece {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                    data,
                }
            }
        };
        Ok(Some(msg))
    }
}
