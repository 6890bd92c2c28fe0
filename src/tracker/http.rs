use crate::stats::TransferStats;
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::Deserialize;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};
use url::Url;
use urlencoding::encode_binary;

/// The port advertised in HTTP announces; nothing listens on it yet.
const ADVERTISED_PORT: u16 = 6881;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// The `peers` key of an announce response: either a compact byte string of
/// 6-byte records or a list of `{ip, port}` dictionaries.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Peers(pub Vec<SocketAddr>);

struct PeersVisitor;

impl<'de> Visitor<'de> for PeersVisitor {
    type Value = Peers;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a compact peer string or a list of peer dictionaries")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Peers, E>
    where
        E: de::Error,
    {
        // 4 bytes IPv4, 2 bytes port, both big-endian
        let peers = v
            .chunks_exact(6)
            .map(|record| {
                let ip = IpAddr::from([record[0], record[1], record[2], record[3]]);
                let port = u16::from_be_bytes([record[4], record[5]]);
                SocketAddr::new(ip, port)
            })
            .collect();
        Ok(Peers(peers))
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Peers, A::Error>
    where
        A: SeqAccess<'de>,
    {
        #[derive(Deserialize)]
        struct PeerEntry {
            ip: String,
            port: i64,
        }

        let mut peers = Vec::new();
        while let Some(entry) = seq.next_element::<PeerEntry>()? {
            match entry.ip.parse::<IpAddr>() {
                Ok(ip) => peers.push(SocketAddr::new(ip, entry.port as u16)),
                Err(_) => warn!("ignoring peer with unparsable address {}", entry.ip),
            }
        }
        Ok(Peers(peers))
    }
}

impl<'de> Deserialize<'de> for Peers {
    fn deserialize<D>(deserializer: D) -> Result<Peers, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(PeersVisitor)
    }
}

#[derive(Debug, Deserialize)]
pub struct AnnounceResponse {
    /// set when the tracker rejected the request; no other key is meaningful
    #[serde(rename = "failure reason", default)]
    pub failure_reason: Option<String>,
    #[serde(rename = "warning message", default)]
    pub warning_message: Option<String>,
    /// seconds the client should wait between regular announces
    #[serde(default)]
    pub interval: Option<i64>,
    /// seeder count
    #[serde(default)]
    pub complete: Option<i64>,
    /// leecher count
    #[serde(default)]
    pub incomplete: Option<i64>,
    #[serde(default)]
    pub peers: Peers,
}

/// Announces to one HTTP tracker and returns the peer addresses it reports.
pub fn announce(
    url: &str,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    stats: &TransferStats,
) -> Result<Vec<SocketAddr>> {
    let parsed = Url::parse(url).with_context(|| format!("failed to parse {}", url))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("no host in {}", url))?
        .to_string();
    let port = parsed.port_or_known_default().unwrap_or(80);
    let addr = (host.as_str(), port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {}", host))?
        .next()
        .ok_or_else(|| anyhow!("no address for {}", host))?;

    let request = build_request(&parsed, &host, info_hash, peer_id, stats);
    let raw = http_exchange(addr, request.as_bytes())?;
    let (code, body) = split_response(&raw)?;
    if code != 200 {
        bail!("tracker answered HTTP {}", code);
    }

    let response: AnnounceResponse =
        serde_bencode::from_bytes(body).context("failed to decode tracker response")?;
    if let Some(reason) = response.failure_reason {
        bail!("tracker refused the announce: {}", reason);
    }
    if let Some(warning) = &response.warning_message {
        warn!("tracker {}: {}", url, warning);
    }
    debug!("tracker {}: {} peers", url, response.peers.0.len());
    Ok(response.peers.0)
}

fn build_request(
    parsed: &Url,
    host: &str,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    stats: &TransferStats,
) -> String {
    let separator = if parsed.query().is_some() { '&' } else { '?' };
    let query = format!(
        "{}{}info_hash={}&peer_id={}&uploaded={}&downloaded={}&port={}&left={}&event=started",
        parsed.query().map(|q| format!("?{}", q)).unwrap_or_default(),
        separator,
        encode_binary(&info_hash),
        encode_binary(&peer_id),
        stats.uploaded(),
        stats.downloaded(),
        ADVERTISED_PORT,
        stats.left(),
    );
    format!(
        "GET {}{} HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
        parsed.path(),
        query,
        host
    )
}

/// Sends one request and reads the connection to its end, all within the
/// tracker timeout.
fn http_exchange(addr: SocketAddr, request: &[u8]) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr)?;
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(8);
    poll.registry().register(
        &mut stream,
        Token(0),
        Interest::READABLE | Interest::WRITABLE,
    )?;

    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    let mut sent = false;
    let mut response = Vec::new();
    loop {
        let now = Instant::now();
        if now >= deadline {
            bail!("tracker did not answer within {:?}", RESPONSE_TIMEOUT);
        }
        poll.poll(&mut events, Some(deadline - now))?;

        for event in events.iter() {
            if event.is_writable() && !sent {
                stream.write_all(request)?;
                sent = true;
                poll.registry()
                    .reregister(&mut stream, Token(0), Interest::READABLE)?;
            }
            if event.is_readable() {
                let mut chunk = [0u8; 4096];
                loop {
                    match stream.read(&mut chunk) {
                        Ok(0) => return Ok(response),
                        Ok(n) => response.extend_from_slice(&chunk[..n]),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }
}

fn split_response(raw: &[u8]) -> Result<(u16, &[u8])> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(raw)? {
        httparse::Status::Complete(offset) => {
            let code = response
                .code
                .ok_or_else(|| anyhow!("response without a status code"))?;
            Ok((code, &raw[offset..]))
        }
        httparse::Status::Partial => bail!("truncated tracker response"),
    }
}
