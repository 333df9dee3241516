//! The peer wire protocol frame codec: the handshake and the length-prefixed
//! message stream that follows it.
//!
//! Both codecs are driven through `tokio_util::codec::Framed`, the same way
//! the rest of the engine's peer session uses them: first a `Framed<_,
//! HandshakeCodec>` for the one-shot handshake, then, after swapping the
//! codec via `Framed::into_parts`/`FramedParts`, a `Framed<_, PeerCodec>` for
//! the rest of the session.

use std::convert::TryFrom;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The fixed protocol string identifying the BitTorrent wire protocol.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// A body length above this is treated as a protocol violation rather than
/// an allocation request, to guard against a misbehaving or malicious peer.
const MAX_MESSAGE_LEN: u32 = 2 * 1024 * 1024;

/// The one-shot handshake message exchanged immediately after connecting,
/// before any other traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
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

/// Encodes and decodes the fixed 68-byte handshake.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(&mut self, h: Handshake, buf: &mut BytesMut) -> io::Result<()> {
        buf.put_u8(h.prot.len() as u8);
        buf.extend_from_slice(&h.prot);
        buf.extend_from_slice(&h.reserved);
        buf.extend_from_slice(&h.info_hash);
        buf.extend_from_slice(&h.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        // 1 (prot length) + 19 (prot) + 8 (reserved) + 20 (info hash) + 20 (peer id)
        const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected protocol string length",
            ));
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
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

/// The wire IDs of the messages this engine understands. An unrecognized ID
/// with otherwise well-formed framing is not a protocol error; the message is
/// decoded as [`Message::Unknown`] and ignored by the caller (see §9 of the
/// design).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
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

impl TryFrom<u8> for MessageId {
    type Error = ();

    fn try_from(v: u8) -> Result<Self, ()> {
        use MessageId::*;
        Ok(match v {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            _ => return Err(()),
        })
    }
}

/// A peer wire protocol message, as defined in §4.1.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// A message with a recognized frame but an ID this engine doesn't
    /// implement. Ignored by callers.
    Unknown,
}

/// Encodes and decodes the length-prefixed peer message stream.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
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
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&bytes);
            }
            Request(info) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(info.piece_index as u32);
                buf.put_u32(info.offset);
                buf.put_u32(info.len);
            }
            Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 2 * 4 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Cancel(info) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(info.piece_index as u32);
                buf.put_u32(info.offset);
                buf.put_u32(info.len);
            }
            Unknown => {
                // we never construct an `Unknown` message for sending;
                // nothing meaningful to encode
                debug_assert!(false, "attempted to encode an Unknown message");
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let msg_len = u32::from_be_bytes(buf[..4].try_into().unwrap());
        if msg_len > MAX_MESSAGE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message length {} exceeds sanity cap", msg_len),
            ));
        }
        let msg_len = msg_len as usize;

        if buf.len() < 4 + msg_len {
            // not enough data yet; ensure we'll have room for the whole frame
            buf.reserve(4 + msg_len - buf.len());
            return Ok(None);
        }

        buf.advance(4);

        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id_byte = buf.get_u8();
        let id = match MessageId::try_from(id_byte) {
            Ok(id) => id,
            Err(()) => {
                // well-formed framing, unrecognized ID: skip the rest of the
                // body and report it as `Unknown` rather than an error
                buf.advance(msg_len - 1);
                return Ok(Some(Message::Unknown));
            }
        };

        let require = |len: usize| -> io::Result<()> {
            if msg_len - 1 < len {
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message body shorter than its type requires",
                ))
            } else {
                Ok(())
            }
        };

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                require(4)?;
                let piece_index = buf.get_u32() as PieceIndex;
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                let mut raw = vec![0u8; msg_len - 1];
                buf.copy_to_slice(&mut raw);
                Message::Bitfield(Bitfield::from_vec(raw))
            }
            MessageId::Request => {
                require(12)?;
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let len = buf.get_u32();
                Message::Request(BlockInfo {
                    piece_index,
                    offset,
                    len,
                })
            }
            MessageId::Piece => {
                require(8)?;
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let data_len = msg_len - 1 - 8;
                let mut data = vec![0u8; data_len];
                buf.copy_to_slice(&mut data);
                Message::Piece {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Cancel => {
                require(12)?;
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let len = buf.get_u32();
                Message::Cancel(BlockInfo {
                    piece_index,
                    offset,
                    len,
                })
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let info_hash = [7u8; 20];
        let peer_id = [9u8; 20];
        let handshake = Handshake::new(info_hash, peer_id);

        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn handshake_rejects_wrong_protocol_string_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(5);
        buf.extend_from_slice(&[0u8; 67]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn keep_alive_round_trips() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &0u32.to_be_bytes());
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }

    #[test]
    fn request_round_trips() {
        let info = BlockInfo {
            piece_index: 3,
            offset: 16384,
            len: 16384,
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(info), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Request(info));
    }

    #[test]
    fn piece_round_trips() {
        let data = vec![1, 2, 3, 4, 5];
        let msg = Message::Piece {
            piece_index: 1,
            offset: 0,
            data: data.clone(),
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn have_round_trips() {
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Have { piece_index: 42 }, &mut buf)
            .unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Have { piece_index: 42 });
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(5); // claims a 5 byte body
        buf.put_u8(MessageId::Choke as u8);
        // only 1 of 5 body bytes present
        assert!(PeerCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn unknown_message_id_is_ignored_not_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u8(200); // not a message ID this engine knows
        buf.put_u8(0);
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Unknown);
    }

    #[test]
    fn oversized_length_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_LEN + 1);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn request_body_too_short_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(1 + 4); // claims only 4 bytes of payload, request needs 12
        buf.put_u8(MessageId::Request as u8);
        buf.put_u32(0);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }
}
