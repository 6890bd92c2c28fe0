pub mod http;
pub mod udp;

use crate::peer::session::PeerSession;
use crate::stats::TransferStats;
use crate::torrent::Torrent;
use log::{debug, error, info, warn};
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stop scraping trackers once this many candidate addresses are known.
pub const MAX_PEERS_TRY_CONNECT: usize = 30;
/// Stop dialing once this many sessions are live.
pub const MAX_PEERS_CONNECTED: usize = 8;

/// 20 bytes derived from the wall clock at startup.
pub fn generate_peer_id() -> [u8; 20] {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let seed = format!("{}.{:09}", now.as_secs(), now.subsec_nanos());
    Sha1::digest(seed.as_bytes()).into()
}

/// Walks the announce list over HTTP and UDP, accumulates unique candidate
/// addresses, then dials them in insertion order.
pub struct TrackerClient {
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    candidates: Vec<SocketAddr>,
}

impl TrackerClient {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> TrackerClient {
        TrackerClient {
            info_hash,
            peer_id,
            candidates: Vec::new(),
        }
    }

    /// Scrapes announce URLs, tier by tier, until enough candidates are known
    /// or the list runs out. A failing tracker is logged and the next one
    /// tried.
    pub fn gather(&mut self, torrent: &Torrent, stats: &TransferStats) {
        'tiers: for tier in torrent.announce_urls() {
            for url in tier {
                if self.candidates.len() >= MAX_PEERS_TRY_CONNECT {
                    break 'tiers;
                }
                let scraped = if url.starts_with("http") {
                    http::announce(&url, self.info_hash, self.peer_id, stats)
                } else if url.starts_with("udp") {
                    udp::announce(&url, self.info_hash, self.peer_id, stats)
                } else {
                    warn!("unknown scheme for {}", url);
                    continue;
                };
                match scraped {
                    Ok(peers) => {
                        for addr in peers {
                            self.add_candidate(addr);
                        }
                    }
                    Err(e) => error!("announce to {} failed: {:#}", url, e),
                }
            }
        }
        info!("got {} candidate peers", self.candidates.len());
    }

    fn add_candidate(&mut self, addr: SocketAddr) {
        if !self.candidates.contains(&addr) {
            self.candidates.push(addr);
        }
    }

    pub fn candidates(&self) -> &[SocketAddr] {
        &self.candidates
    }

    /// Dials candidates in insertion order; every session that connects gets
    /// the handshake immediately. Stops once enough connections are live.
    pub fn connect_peers(&self, number_of_pieces: usize) -> Vec<PeerSession> {
        info!("trying to connect to {} peer(s)", self.candidates.len());
        let mut connected = Vec::new();
        for &addr in &self.candidates {
            if connected.len() >= MAX_PEERS_CONNECTED {
                break;
            }
            match PeerSession::connect(addr, number_of_pieces) {
                Ok(mut session) => {
                    session.send_handshake(self.info_hash, self.peer_id);
                    if session.is_healthy() {
                        connected.push(session);
                        info!(
                            "connected to {} ({}/{} peers)",
                            addr,
                            connected.len(),
                            MAX_PEERS_CONNECTED
                        );
                    }
                }
                Err(e) => debug!("failed to connect to {}: {}", addr, e),
            }
        }
        connected
    }
}
