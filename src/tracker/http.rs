//! HTTP tracker transport: a plain GET request with the announce
//! parameters percent-encoded into the query string, and a bencoded
//! response body.
//!
//! Grounded in the teacher's `tracker/http.rs` for the raw mio
//! `TcpStream` + manual HTTP request construction and header-end
//! scanning, but the response body is parsed with the hand-rolled
//! `bencode` module instead of `serde_bencode` (consistent with the rest
//! of this crate), the status line is actually checked instead of being
//! ignored, and a `"failure reason"` key in the response is surfaced as
//! an error rather than silently producing a response with no peers.

use crate::bencode::{self, Value};
use crate::torrent::Torrent;
use anyhow::{anyhow, bail, Context, Result};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use url::Url;

const TOKEN: Token = Token(0);

pub struct AnnounceResult {
    pub interval: u32,
    pub peers: Vec<SocketAddr>,
}

pub fn announce(
    announce_url: &str,
    torrent: &Torrent,
    port: u16,
) -> Result<AnnounceResult> {
    let url = Url::parse(announce_url).with_context(|| format!("parsing {announce_url}"))?;
    let host = url.host_str().ok_or_else(|| anyhow!("no host in {announce_url}"))?;
    let conn_port = url.port_or_known_default().unwrap_or(80);
    let addr = format!("{host}:{conn_port}")
        .to_socket_addrs()
        .with_context(|| format!("resolving {host}:{conn_port}"))?
        .next()
        .ok_or_else(|| anyhow!("no address for {host}:{conn_port}"))?;

    let query = build_query(torrent, port);
    let path = if url.path().is_empty() { "/" } else { url.path() };
    let request = format!(
        "GET {path}?{query} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n"
    );

    let raw = round_trip(addr, request.as_bytes())?;
    parse_announce_response(&raw)
}

fn build_query(torrent: &Torrent, port: u16) -> String {
    let info_hash = urlencoding::encode_binary(&torrent.meta.info_hash);
    let peer_id = urlencoding::encode_binary(&torrent.peer_id);
    format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        info_hash,
        peer_id,
        port,
        torrent.uploaded(),
        torrent.downloaded(),
        torrent.remaining(),
    )
}

fn round_trip(addr: SocketAddr, request: &[u8]) -> Result<Vec<u8>> {
    let mut poll = Poll::new().context("creating mio poll")?;
    let mut events = Events::with_capacity(16);
    let mut stream = TcpStream::connect(addr).with_context(|| format!("connecting to {addr}"))?;
    poll.registry()
        .register(&mut stream, TOKEN, Interest::WRITABLE)
        .context("registering tracker socket")?;

    let mut sent = false;
    let mut response = Vec::new();

    loop {
        poll.poll(&mut events, Some(Duration::from_secs(10)))
            .context("polling for tracker connection")?;
        if events.is_empty() {
            bail!("timed out waiting for tracker {addr}");
        }
        for event in events.iter() {
            if event.is_writable() && !sent {
                stream.write_all(request).context("writing tracker request")?;
                poll.registry()
                    .reregister(&mut stream, TOKEN, Interest::READABLE)
                    .context("reregistering tracker socket")?;
                sent = true;
            }
            if event.is_readable() {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => return Ok(response),
                        Ok(n) => response.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e).context("reading tracker response"),
                    }
                }
            }
        }
    }
}

fn parse_announce_response(raw: &[u8]) -> Result<AnnounceResult> {
    let header_end = find_header_end(raw).ok_or_else(|| anyhow!("malformed HTTP response"))?;
    let status_line = String::from_utf8_lossy(&raw[..header_end]);
    let status_line = status_line.lines().next().unwrap_or_default();
    let status_code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow!("could not parse status line {status_line:?}"))?;
    if !(200..300).contains(&status_code) {
        bail!("tracker returned HTTP {status_code}");
    }

    let body = &raw[header_end..];
    let (value, _) = bencode::decode(body).context("decoding tracker response")?;

    if let Some(reason) = value.get("failure reason").and_then(Value::as_bytes) {
        bail!("tracker failure: {}", String::from_utf8_lossy(reason));
    }

    let interval = value.get("interval").and_then(Value::as_int).unwrap_or(1800) as u32;
    let peers_raw = value
        .get("peers")
        .and_then(Value::as_bytes)
        .ok_or_else(|| anyhow!("tracker response missing compact 'peers'"))?;
    let peers = decode_compact_peers(peers_raw)?;

    Ok(AnnounceResult { interval, peers })
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Decodes the compact IPv4 peer list: 6 bytes per peer (4-byte address,
/// 2-byte big-endian port). `peers6` is out of scope (spec.md names only
/// the compact IPv4 form).
fn decode_compact_peers(data: &[u8]) -> Result<Vec<SocketAddr>> {
    if data.len() % 6 != 0 {
        bail!("compact peer list length {} is not a multiple of 6", data.len());
    }
    Ok(data
        .chunks_exact(6)
        .map(|chunk| {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::from((ip, port))
        })
        .collect())
}
