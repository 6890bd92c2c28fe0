use crate::stats::TransferStats;
use anyhow::{anyhow, bail, Context, Result};
use byteorder::{BigEndian, ReadBytesExt};
use log::debug;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use rand::Rng;
use std::io::{self, Cursor};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};
use url::Url;

/// magic constant for the UDP tracker protocol, see BEP 15
const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

/// The port advertised in UDP announces; nothing listens on it yet.
const ADVERTISED_PORT: u16 = 8000;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    pub transaction_id: u32,
}

impl ConnectRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        buf.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id.to_be_bytes());
        buf
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ConnectResponse {
    pub action: u32,
    pub transaction_id: u32,
    pub connection_id: u64,
}

impl ConnectResponse {
    pub fn from_bytes(bytes: &[u8]) -> io::Result<ConnectResponse> {
        let mut rdr = Cursor::new(bytes);
        Ok(ConnectResponse {
            action: rdr.read_u32::<BigEndian>()?,
            transaction_id: rdr.read_u32::<BigEndian>()?,
            connection_id: rdr.read_u64::<BigEndian>()?,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub connection_id: u64,
    pub transaction_id: u32,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
}

impl AnnounceRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(98);
        buf.extend_from_slice(&self.connection_id.to_be_bytes());
        buf.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id.to_be_bytes());
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        buf.extend_from_slice(&self.downloaded.to_be_bytes());
        buf.extend_from_slice(&self.left.to_be_bytes());
        buf.extend_from_slice(&self.uploaded.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes()); // event: none
        buf.extend_from_slice(&0u32.to_be_bytes()); // ip: let the tracker detect it
        buf.extend_from_slice(&0u32.to_be_bytes()); // key
        buf.extend_from_slice(&(-1i32).to_be_bytes()); // num_want: tracker's default
        buf.extend_from_slice(&ADVERTISED_PORT.to_be_bytes());
        buf
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub action: u32,
    pub transaction_id: u32,
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddr>,
}

impl AnnounceResponse {
    pub fn from_bytes(bytes: &[u8]) -> io::Result<AnnounceResponse> {
        let mut rdr = Cursor::new(bytes);
        let action = rdr.read_u32::<BigEndian>()?;
        let transaction_id = rdr.read_u32::<BigEndian>()?;
        let interval = rdr.read_u32::<BigEndian>()?;
        let leechers = rdr.read_u32::<BigEndian>()?;
        let seeders = rdr.read_u32::<BigEndian>()?;

        // 6-byte records until the end of the packet: ipv4, then port
        let peers = bytes[rdr.position() as usize..]
            .chunks_exact(6)
            .map(|record| {
                let ip = IpAddr::from([record[0], record[1], record[2], record[3]]);
                let port = u16::from_be_bytes([record[4], record[5]]);
                SocketAddr::new(ip, port)
            })
            .collect();

        Ok(AnnounceResponse {
            action,
            transaction_id,
            interval,
            leechers,
            seeders,
            peers,
        })
    }
}

/// Runs the connect/announce exchange against one UDP tracker and returns the
/// peer addresses it reports. Trackers resolving to private addresses are
/// skipped.
pub fn announce(
    url: &str,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    stats: &TransferStats,
) -> Result<Vec<SocketAddr>> {
    let parsed = Url::parse(url).with_context(|| format!("failed to parse {}", url))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("no host in {}", url))?;
    let port = parsed
        .port()
        .ok_or_else(|| anyhow!("no port in {}", url))?;
    let addr = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {}", host))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| anyhow!("no IPv4 address for {}", host))?;
    if let IpAddr::V4(ip) = addr.ip() {
        if ip.is_private() {
            debug!("skipping tracker {} on private address {}", url, ip);
            return Ok(Vec::new());
        }
    }

    let mut socket = UdpSocket::bind("0.0.0.0:0".parse()?)?;
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(8);
    poll.registry()
        .register(&mut socket, Token(0), Interest::READABLE)?;

    let mut rng = rand::thread_rng();

    let transaction_id = rng.gen::<u32>();
    let request = ConnectRequest { transaction_id };
    let response = exchange(&socket, &mut poll, &mut events, addr, &request.to_bytes())?;
    let connect = ConnectResponse::from_bytes(&response)?;
    if connect.transaction_id != transaction_id {
        bail!("connect transaction id mismatch");
    }
    if connect.action != ACTION_CONNECT {
        bail!("tracker refused the connect, action {}", connect.action);
    }

    let transaction_id = rng.gen::<u32>();
    let request = AnnounceRequest {
        connection_id: connect.connection_id,
        transaction_id,
        info_hash,
        peer_id,
        downloaded: stats.downloaded(),
        left: stats.left(),
        uploaded: stats.uploaded(),
    };
    let response = exchange(&socket, &mut poll, &mut events, addr, &request.to_bytes())?;
    let announce = AnnounceResponse::from_bytes(&response)?;
    if announce.transaction_id != transaction_id {
        bail!("announce transaction id mismatch");
    }
    if announce.action != ACTION_ANNOUNCE {
        bail!("tracker refused the announce, action {}", announce.action);
    }

    debug!(
        "tracker {}: interval {}s, {} seeders, {} leechers, {} peers",
        url,
        announce.interval,
        announce.seeders,
        announce.leechers,
        announce.peers.len()
    );
    Ok(announce.peers)
}

fn exchange(
    socket: &UdpSocket,
    poll: &mut Poll,
    events: &mut Events,
    addr: SocketAddr,
    packet: &[u8],
) -> Result<Vec<u8>> {
    socket.send_to(packet, addr)?;

    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    loop {
        let now = Instant::now();
        if now >= deadline {
            bail!("tracker did not answer within {:?}", RESPONSE_TIMEOUT);
        }
        poll.poll(events, Some(deadline - now))?;

        let mut buf = [0u8; 2048];
        match socket.recv_from(&mut buf) {
            Ok((n, _)) => return Ok(buf[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
