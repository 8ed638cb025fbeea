//! Tracker client: announces this peer to an HTTP or UDP tracker and
//! returns the peers it hands back, gating re-announces by the interval
//! the tracker last requested.
//!
//! Grounded in the Python original's `peer_stores.py` (`Tracker`,
//! `ok_to_announce`, `store_from_url` dispatching by URL scheme) —
//! generalized into an enum dispatch over the two transports this crate
//! implements, rather than a class hierarchy.

pub mod http;
pub mod udp;

use crate::torrent::{AnnounceUrl, Torrent, TrackerScheme};
use anyhow::Result;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1800);

pub struct Tracker {
    pub url: AnnounceUrl,
    last_announce: Option<Instant>,
    interval: Duration,
}

impl Tracker {
    pub fn new(url: AnnounceUrl) -> Tracker {
        Tracker {
            url,
            last_announce: None,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn ok_to_announce(&self) -> bool {
        match self.last_announce {
            None => true,
            Some(last) => last.elapsed() >= self.interval,
        }
    }

    /// Announces to this tracker and returns the peers it reports. Does
    /// nothing and returns an empty list if `ok_to_announce` is false —
    /// callers that want to force an announce should check that
    /// separately.
    pub fn announce(&mut self, torrent: &Torrent, port: u16) -> Result<Vec<SocketAddr>> {
        if !self.ok_to_announce() {
            return Ok(Vec::new());
        }

        let peers = match self.url.scheme {
            TrackerScheme::Http => {
                let result = http::announce(&self.url.url, torrent, port)?;
                self.interval = Duration::from_secs(result.interval as u64);
                result.peers
            }
            TrackerScheme::Udp => {
                let addr = resolve_udp_authority(&self.url.url)?;
                let mut client = udp::UdpTracker::new()?;
                client.connect(addr)?;
                let result = client.announce(addr, torrent, port)?;
                self.interval = Duration::from_secs(result.interval as u64);
                log::debug!(
                    "{}: {} seeders, {} leechers",
                    self.url.url,
                    result.seeders,
                    result.leechers
                );
                result.peers
            }
        };

        self.last_announce = Some(Instant::now());
        Ok(peers)
    }
}

fn resolve_udp_authority(url: &str) -> Result<SocketAddr> {
    let parsed = url::Url::parse(url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("no host in {url}"))?;
    let port = parsed.port().unwrap_or(80);
    use std::net::ToSocketAddrs;
    format!("{host}:{port}")
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("no address for {host}:{port}"))
}
