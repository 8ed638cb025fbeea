//! Piece value object: a fixed-size chunk of the torrent, its expected
//! SHA-1 digest, and whatever bytes have been accumulated for it so far.
//!
//! Grounded in the Python original's `pieces.py` (`Piece`/`PieceLocal`/
//! `PieceRemote`), reshaped into owned Rust value types: `Piece` plays the
//! role of `PieceLocal` (owned by the `Torrent`), and `PieceRemote` is the
//! per-peer shadow described in spec.md §3 — a plain value with no
//! back-reference to its owning `Peer`.

use sha1::{Digest, Sha1};

pub const BLOCK_SIZE: usize = 1 << 14;

/// A piece known to the local torrent: its index, expected hash, and
/// whatever bytes have been downloaded for it so far.
#[derive(Debug, Clone)]
pub struct Piece {
    pub index: u32,
    pub sha: [u8; 20],
    pub data: Vec<u8>,
}

impl Piece {
    pub fn new(index: u32, sha: [u8; 20]) -> Piece {
        Piece {
            index,
            sha,
            data: Vec::new(),
        }
    }

    pub fn digest(&self) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        hasher.finalize().into()
    }

    pub fn valid(&self) -> bool {
        self.digest() == self.sha
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn hex(&self) -> String {
        hex::encode(self.sha)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Replaces this piece's data with the data from a `PieceRemote` that
    /// has finished downloading. Mirrors `PieceLocal.complete` in the
    /// Python original.
    pub fn absorb(&mut self, remote: &PieceRemote) {
        self.data = remote.data.clone();
    }
}

/// A piece as seen from one peer's perspective: whether that peer has
/// advertised it, and whatever blocks have arrived from it so far.
///
/// Owned exclusively by its `Peer` — it never outlives it, and it carries
/// no reference back to the peer or the torrent (spec.md §9 Design Notes).
#[derive(Debug, Clone)]
pub struct PieceRemote {
    pub index: u32,
    pub sha: [u8; 20],
    pub have: bool,
    pub data: Vec<u8>,
}

impl PieceRemote {
    pub fn new(index: u32, sha: [u8; 20]) -> PieceRemote {
        PieceRemote {
            index,
            sha,
            have: false,
            data: Vec::new(),
        }
    }

    pub fn digest(&self) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        hasher.finalize().into()
    }

    pub fn valid(&self) -> bool {
        self.digest() == self.sha
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Writes `block` into this piece's buffer at `begin`, zero-extending
    /// the buffer if the block arrives past its current end. Blocks may
    /// arrive out of order; overlapping writes are well-defined (last
    /// write wins for the overlapped range) but not meaningful protocol
    /// behavior, per spec.md §4.4.
    pub fn insert_block(&mut self, begin: usize, block: &[u8]) {
        let end = begin + block.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[begin..end].copy_from_slice(block);
    }
}
