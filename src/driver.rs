//! The top-level scheduler loop: connects to peers discovered via the
//! tracker, picks a random missing piece and a random peer that has it,
//! downloads it, persists and advertises it, and reconstructs the output
//! files once everything validates.
//!
//! Grounded in the Python original's `torrent.py::run` (random
//! piece/peer selection, `advertise_piece`, `clean_peers`) and the
//! teacher's `peer/manager.rs` stub (never filled in — this is the
//! module SPEC_FULL.md asks to build out in full).

use crate::peer::engine::{Peer, PeerStatus};
use crate::peer::message::Message;
use crate::torrent::Torrent;
use crate::tracker::Tracker;
use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use std::net::SocketAddr;

pub const MAX_PEERS: usize = 20;
pub const DEFAULT_PORT: u16 = 6881;

pub struct Driver {
    pub torrent: Torrent,
    pub trackers: Vec<Tracker>,
    pub peers: Vec<Peer>,
    pub port: u16,
}

impl Driver {
    pub fn new(torrent: Torrent, port: u16) -> Driver {
        let trackers = torrent
            .meta
            .announce_urls
            .iter()
            .cloned()
            .map(Tracker::new)
            .collect();
        Driver {
            torrent,
            trackers,
            peers: Vec::new(),
            port,
        }
    }

    /// Runs the scheduler until every piece is valid, then reconstructs
    /// the output files. Each iteration's errors are caught and logged
    /// rather than aborting the whole download, mirroring the Python
    /// original's per-iteration `try`/`except BitTorrentPeerException`.
    pub fn run(&mut self) -> Result<()> {
        self.torrent.create_directories()?;

        while !self.torrent.complete() {
            if let Err(e) = self.step() {
                log::warn!("driver iteration failed: {e:#}");
            }
        }

        self.torrent.reconstruct().context("reconstructing output files")?;
        log::info!("download complete: {:?}", self.torrent.save_directory());
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        self.clean_peers();
        self.discover_peers()?;

        let Some(piece_index) = self.pick_piece() else {
            return Ok(());
        };
        let Some(peer_idx) = self.pick_peer(piece_index) else {
            return Ok(());
        };

        let sha = self.torrent.pieces[piece_index].sha;
        let piece_len = self.torrent.meta.piece_len(piece_index);
        let peer = &mut self.peers[peer_idx];

        match peer.acquire_piece(piece_index as u32, sha, piece_len, &self.torrent.pieces) {
            Ok(piece) => {
                self.torrent.pieces[piece_index] = piece;
                self.torrent.persist_piece(&self.torrent.pieces[piece_index])?;
                self.advertise_piece(piece_index);
            }
            Err(e) => {
                log::warn!("failed to acquire piece {piece_index} from a peer: {e:#}");
            }
        }
        Ok(())
    }

    fn discover_peers(&mut self) -> Result<()> {
        if self.peers.len() >= MAX_PEERS {
            return Ok(());
        }
        let mut discovered: Vec<SocketAddr> = Vec::new();
        for tracker in &mut self.trackers {
            if !tracker.ok_to_announce() {
                continue;
            }
            match tracker.announce(&self.torrent, self.port) {
                Ok(addrs) => discovered.extend(addrs),
                Err(e) => log::warn!("tracker announce to {} failed: {e:#}", tracker.url.url),
            }
        }

        let known: std::collections::HashSet<SocketAddr> =
            self.peers.iter().map(|p| p.addr).collect();
        for addr in discovered {
            if self.peers.len() >= MAX_PEERS || known.contains(&addr) {
                continue;
            }
            match Peer::connect(
                addr,
                self.torrent.meta.info_hash,
                self.torrent.peer_id,
                self.torrent.meta.piece_count(),
            ) {
                Ok(mut peer) => {
                    log::info!("connected to peer {addr}");
                    // Per spec.md §4.5 step 1, the first post-handshake
                    // message is expected (but not required) to be a
                    // bitfield; fold whatever arrives into peer state.
                    match peer.recv() {
                        Ok(message) => {
                            peer.apply(&message);
                        }
                        Err(e) => log::debug!("no initial message from {addr}: {e:#}"),
                    }
                    self.peers.push(peer);
                }
                Err(e) => log::debug!("could not connect to peer {addr}: {e:#}"),
            }
        }
        Ok(())
    }

    /// Drops peers that have gone `Closed` or `Bad`, per spec.md §4.4 and
    /// the Python original's `clean_peers`.
    fn clean_peers(&mut self) {
        self.peers
            .retain(|p| !matches!(p.status, PeerStatus::Closed | PeerStatus::Bad));
    }

    fn pick_piece(&self) -> Option<usize> {
        let missing: Vec<usize> = self
            .torrent
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.valid())
            .map(|(i, _)| i)
            .collect();
        missing.choose(&mut rand::thread_rng()).copied()
    }

    fn pick_peer(&self, piece_index: usize) -> Option<usize> {
        let candidates: Vec<usize> = self
            .peers
            .iter()
            .enumerate()
            // `PeerStatus::Ok` already excludes a peer we're CHOKE'd by
            // (spec.md §4.5 step 3's "not in CHOKE" is this status, set on
            // a received `Choke` — not the protocol-default choked flag,
            // which every freshly-handshaked peer starts with and which
            // `interested`/request flow control checks separately).
            .filter(|(_, p)| p.status == PeerStatus::Ok && p.bitfield.has_piece(piece_index))
            .map(|(i, _)| i)
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    /// Sends `Have(index)` to every connected peer, per the Python
    /// original's `advertise_piece` (fixed to look the piece up directly
    /// by index rather than via a fragile `.index()` search).
    fn advertise_piece(&mut self, index: usize) {
        for peer in &mut self.peers {
            if let Err(e) = peer.send(&Message::Have(index as u32)) {
                log::debug!("failed to advertise piece {index} to {}: {e:#}", peer.addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{AnnounceUrl, Metainfo, TrackerScheme};

    fn empty_driver() -> Driver {
        let meta = Metainfo {
            name: "x".into(),
            files: vec![],
            piece_length: 16384,
            piece_hashes: vec![],
            info_hash: [0; 20],
            announce_urls: vec![AnnounceUrl {
                url: "http://tracker.example/announce".into(),
                scheme: TrackerScheme::Http,
            }],
        };
        let tmp = tempfile::tempdir().unwrap();
        let torrent = Torrent::load(meta, tmp.path()).unwrap();
        Driver::new(torrent, DEFAULT_PORT)
    }

    #[test]
    fn pick_piece_returns_none_when_complete() {
        let driver = empty_driver();
        assert_eq!(driver.pick_piece(), None);
    }

    #[test]
    fn clean_peers_is_a_no_op_with_no_peers() {
        let mut driver = empty_driver();
        driver.clean_peers();
        assert!(driver.peers.is_empty());
    }

    #[test]
    fn one_tracker_is_loaded_from_announce() {
        let driver = empty_driver();
        assert_eq!(driver.trackers.len(), 1);
    }
}
