//! Handshake message construction and validation.
//!
//! Grounded in the teacher's `peer/handshake.rs` for the struct shape, but
//! dropping its `as_bytes_mut` unsafe transmute (marked with the teacher's
//! own `// TODO: look more into this`) in favor of plain byte slicing —
//! the struct is tiny and fixed-size, there's no reason to reach for
//! unsafe to serialize it.

use crate::torrent::PROTOCOL_ID;
use thiserror::Error;

pub const HANDSHAKE_LEN: usize = 68;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake too short: need {HANDSHAKE_LEN} bytes, have {0}")]
    TooShort(usize),
    #[error("unexpected protocol identifier length {0}")]
    BadPstrLen(u8),
    #[error("unexpected protocol identifier")]
    BadPstr,
    #[error("info hash mismatch")]
    InfoHashMismatch,
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake { info_hash, peer_id }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        crate::torrent::handshake_bytes(&self.info_hash, &self.peer_id)
    }

    /// Parses a peer's handshake bytes and confirms the protocol
    /// identifier is well-formed. Does not itself check `info_hash`
    /// against the expected torrent — use `expect_info_hash` for that,
    /// since the caller may want to surface a more specific error first.
    pub fn from_bytes(bytes: &[u8]) -> Result<Handshake, HandshakeError> {
        if bytes.len() < HANDSHAKE_LEN {
            return Err(HandshakeError::TooShort(bytes.len()));
        }
        let pstr_len = bytes[0];
        if pstr_len as usize != PROTOCOL_ID.len() {
            return Err(HandshakeError::BadPstrLen(pstr_len));
        }
        if &bytes[1..20] != PROTOCOL_ID {
            return Err(HandshakeError::BadPstr);
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);
        Ok(Handshake { info_hash, peer_id })
    }

    pub fn expect_info_hash(&self, expected: &[u8; 20]) -> Result<(), HandshakeError> {
        if &self.info_hash != expected {
            return Err(HandshakeError::InfoHashMismatch);
        }
        Ok(())
    }
}
