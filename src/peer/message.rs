//! Peer wire protocol messages: the length-prefixed, typed messages
//! exchanged after the handshake.
//!
//! Grounded in the teacher's `peer/message.rs` (the `Message` enum shape
//! and variant set), but the length-prefix handling is rewritten: the
//! teacher cast the payload length to `u8` and only ever emitted a single
//! length byte, which silently truncates for any `bitfield`/`piece`
//! payload over 255 bytes — not a theoretical case, since a single block
//! payload is 16 KiB. This version always writes the real BitTorrent
//! framing: a 4-byte big-endian length prefix covering the id byte plus
//! payload.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("message body too short for id {id}: need {need} bytes, have {have}")]
    TooShort { id: u8, need: usize, have: usize },
    #[error("unknown message id {0}")]
    UnknownId(u8),
}

impl Message {
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
            Message::Port(_) => Some(9),
        }
    }

    /// Serializes this message with its 4-byte big-endian length prefix,
    /// ready to write directly to the peer socket.
    pub fn serialize(&self) -> Vec<u8> {
        let body = self.serialize_body();
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Serializes everything after the length prefix: the id byte (absent
    /// for `KeepAlive`) followed by the payload.
    fn serialize_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        if let Some(id) = self.id() {
            body.push(id);
        }
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have(index) => body.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield(bits) => body.extend_from_slice(bits),
            Message::Request { index, begin, length } => {
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece { index, begin, block } => {
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(block);
            }
            Message::Cancel { index, begin, length } => {
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
            }
            Message::Port(port) => body.extend_from_slice(&port.to_be_bytes()),
        }
        body
    }

    /// Parses a message body (everything after the 4-byte length prefix
    /// has already been stripped by the caller's framing loop). An empty
    /// body is a keep-alive.
    pub fn deserialize(body: &[u8]) -> Result<Message, MessageError> {
        let Some((&id, rest)) = body.split_first() else {
            return Ok(Message::KeepAlive);
        };
        match id {
            0 => Ok(Message::Choke),
            1 => Ok(Message::Unchoke),
            2 => Ok(Message::Interested),
            3 => Ok(Message::NotInterested),
            4 => {
                require_len(id, rest, 4)?;
                Ok(Message::Have(BigEndian::read_u32(rest)))
            }
            5 => Ok(Message::Bitfield(rest.to_vec())),
            6 => {
                require_len(id, rest, 12)?;
                Ok(Message::Request {
                    index: BigEndian::read_u32(&rest[0..4]),
                    begin: BigEndian::read_u32(&rest[4..8]),
                    length: BigEndian::read_u32(&rest[8..12]),
                })
            }
            7 => {
                require_len(id, rest, 8)?;
                Ok(Message::Piece {
                    index: BigEndian::read_u32(&rest[0..4]),
                    begin: BigEndian::read_u32(&rest[4..8]),
                    block: rest[8..].to_vec(),
                })
            }
            8 => {
                require_len(id, rest, 12)?;
                Ok(Message::Cancel {
                    index: BigEndian::read_u32(&rest[0..4]),
                    begin: BigEndian::read_u32(&rest[4..8]),
                    length: BigEndian::read_u32(&rest[8..12]),
                })
            }
            9 => {
                require_len(id, rest, 2)?;
                Ok(Message::Port(BigEndian::read_u16(rest)))
            }
            other => Err(MessageError::UnknownId(other)),
        }
    }
}

fn require_len(id: u8, rest: &[u8], need: usize) -> Result<(), MessageError> {
    if rest.len() < need {
        return Err(MessageError::TooShort {
            id,
            need,
            have: rest.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of(serialized: &[u8]) -> &[u8] {
        let len = BigEndian::read_u32(&serialized[0..4]) as usize;
        &serialized[4..4 + len]
    }

    #[test]
    fn keep_alive_is_zero_length_prefix_only() {
        let bytes = Message::KeepAlive.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert_eq!(Message::deserialize(&[]).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn large_bitfield_round_trips_without_truncation() {
        // 300 bytes would overflow a u8 length byte, the teacher's bug.
        let bits = vec![0xAAu8; 300];
        let msg = Message::Bitfield(bits.clone());
        let serialized = msg.serialize();
        let prefix_len = BigEndian::read_u32(&serialized[0..4]) as usize;
        assert_eq!(prefix_len, 301); // id byte + 300 payload bytes
        let decoded = Message::deserialize(body_of(&serialized)).unwrap();
        assert_eq!(decoded, Message::Bitfield(bits));
    }

    #[test]
    fn large_piece_block_round_trips() {
        let block = vec![0x7Fu8; crate::piece::BLOCK_SIZE];
        let msg = Message::Piece {
            index: 3,
            begin: 16384,
            block: block.clone(),
        };
        let serialized = msg.serialize();
        let decoded = Message::deserialize(body_of(&serialized)).unwrap();
        assert_eq!(
            decoded,
            Message::Piece {
                index: 3,
                begin: 16384,
                block
            }
        );
    }

    #[test]
    fn request_round_trip() {
        let msg = Message::Request {
            index: 1,
            begin: 2,
            length: 16384,
        };
        let serialized = msg.serialize();
        let decoded = Message::deserialize(body_of(&serialized)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn cancel_packs_index_begin_length_tuple() {
        // Fixes the Python original's send_cancel, which referenced an
        // undefined `header` variable instead of packing this tuple.
        let msg = Message::Cancel {
            index: 5,
            begin: 0,
            length: 16384,
        };
        let serialized = msg.serialize();
        let decoded = Message::deserialize(body_of(&serialized)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn truncated_have_body_errors() {
        let err = Message::deserialize(&[4, 0, 0]).unwrap_err();
        assert!(matches!(err, MessageError::TooShort { id: 4, .. }));
    }

    #[test]
    fn unknown_id_errors() {
        let err = Message::deserialize(&[200]).unwrap_err();
        assert_eq!(err, MessageError::UnknownId(200));
    }

    #[test]
    fn choke_family_round_trip() {
        for msg in [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
        ] {
            let serialized = msg.serialize();
            let decoded = Message::deserialize(body_of(&serialized)).unwrap();
            assert_eq!(decoded, msg);
        }
    }
}
