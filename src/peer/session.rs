use crate::bitfield::BitField;
use crate::peer::handshake::{Handshake, HANDSHAKE_LEN};
use crate::peer::message::Message;
use bytes::{Buf, BytesMut};
use log::{debug, warn};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Minimum gap between back-to-back requests to the same peer.
pub const SEND_COOLDOWN: Duration = Duration::from_millis(200);

/// The four wire-protocol state flags, from our side of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFlags {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for SessionFlags {
    fn default() -> SessionFlags {
        SessionFlags {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// One live connection to a remote peer: the socket, the inbound frame
/// buffer, the state flags and the remote's bitfield.
pub struct PeerSession {
    pub addr: SocketAddr,
    stream: TcpStream,
    read_buffer: BytesMut,
    handshaked: bool,
    healthy: bool,
    last_send: Option<Instant>,
    pub flags: SessionFlags,
    pub bitfield: BitField,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("addr", &self.addr)
            .field("handshaked", &self.handshaked)
            .field("healthy", &self.healthy)
            .field("flags", &self.flags)
            .finish()
    }
}

impl PeerSession {
    /// Opens a TCP connection with a 2 second timeout and switches it to
    /// non-blocking mode.
    pub fn connect(addr: SocketAddr, number_of_pieces: usize) -> io::Result<PeerSession> {
        let stream = std::net::TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(stream);
        debug!("connected to peer {}", addr);

        Ok(PeerSession {
            addr,
            stream,
            read_buffer: BytesMut::new(),
            handshaked: false,
            healthy: true,
            last_send: None,
            flags: SessionFlags::default(),
            bitfield: BitField::new(number_of_pieces),
        })
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.stream, token, Interest::READABLE)
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// Writes raw bytes; any failure (including a full kernel buffer) tears
    /// the session down.
    pub fn send(&mut self, bytes: &[u8]) {
        match self.stream.write_all(bytes) {
            Ok(()) => self.last_send = Some(Instant::now()),
            Err(e) => {
                warn!("{}: send failed: {}", self.addr, e);
                self.healthy = false;
            }
        }
    }

    pub fn send_message(&mut self, message: &Message) {
        debug!("{}: sending {:?} message", self.addr, message.id());
        self.send(&message.serialize());
    }

    pub fn send_handshake(&mut self, info_hash: [u8; 20], peer_id: [u8; 20]) {
        self.send(&Handshake::new(info_hash, peer_id).to_bytes());
    }

    pub fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    /// Drains everything the socket currently has, then parses complete
    /// frames out of the buffer.
    pub fn read_ready(&mut self) -> Vec<Message> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    debug!("{}: connection closed by peer", self.addr);
                    self.healthy = false;
                    break;
                }
                Ok(n) => self.read_buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("{}: recv failed: {}", self.addr, e);
                    self.healthy = false;
                    break;
                }
            }
        }
        self.extract_messages()
    }

    /// Appends bytes to the inbound buffer and yields every complete message
    /// it now holds. The first thing a peer may send is its handshake;
    /// anything else poisons the session.
    pub fn ingest(&mut self, data: &[u8]) -> Vec<Message> {
        self.read_buffer.extend_from_slice(data);
        self.extract_messages()
    }

    fn extract_messages(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while self.read_buffer.len() > 4 && self.healthy {
            if !self.handshaked {
                if self.read_buffer.len() < HANDSHAKE_LEN {
                    break;
                }
                match Handshake::from_bytes(&self.read_buffer[..HANDSHAKE_LEN]) {
                    Ok(_) => {
                        self.handshaked = true;
                        self.read_buffer.advance(HANDSHAKE_LEN);
                        debug!("{}: handshake received", self.addr);
                        continue;
                    }
                    Err(e) => {
                        warn!("{}: first message was not a handshake: {}", self.addr, e);
                        self.healthy = false;
                        break;
                    }
                }
            }

            // a zero length prefix is a keep-alive
            if self.read_buffer[..4] == [0, 0, 0, 0] {
                self.read_buffer.advance(4);
                continue;
            }

            let length = u32::from_be_bytes([
                self.read_buffer[0],
                self.read_buffer[1],
                self.read_buffer[2],
                self.read_buffer[3],
            ]) as usize;
            if self.read_buffer.len() < 4 + length {
                break;
            }
            let frame = self.read_buffer.split_to(4 + length);
            match Message::deserialize(&frame) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!("{}: malformed frame: {}", self.addr, e);
                    self.healthy = false;
                }
            }
        }
        messages
    }

    // --- queries used by the scheduler ---

    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.has_piece(index)
    }

    /// The remote is not choking us.
    pub fn is_unchoked(&self) -> bool {
        !self.flags.peer_choking
    }

    pub fn am_interested(&self) -> bool {
        self.flags.am_interested
    }

    /// The remote wants our data.
    pub fn is_interested(&self) -> bool {
        self.flags.peer_interested
    }

    pub fn am_unchoking(&self) -> bool {
        !self.flags.am_choking
    }

    /// Past the per-peer request cooldown.
    pub fn eligible(&self) -> bool {
        match self.last_send {
            None => true,
            Some(at) => at.elapsed() > SEND_COOLDOWN,
        }
    }

    // --- per-message reactions ---

    pub fn handle_choke(&mut self) {
        debug!("{}: choked us", self.addr);
        self.flags.peer_choking = true;
    }

    pub fn handle_unchoke(&mut self) {
        debug!("{}: unchoked us", self.addr);
        self.flags.peer_choking = false;
    }

    pub fn handle_interested(&mut self) {
        self.flags.peer_interested = true;
        if self.flags.am_choking {
            self.send_message(&Message::Unchoke);
            self.flags.am_choking = false;
        }
    }

    pub fn handle_not_interested(&mut self) {
        self.flags.peer_interested = false;
    }

    pub fn handle_have(&mut self, index: u32) {
        self.bitfield.set(index as usize);
        self.express_interest();
    }

    pub fn handle_bitfield(&mut self, payload: &[u8]) {
        match BitField::from_bytes(payload, self.bitfield.len()) {
            Ok(bitfield) => {
                self.bitfield = bitfield;
                self.express_interest();
            }
            Err(e) => {
                warn!("{}: unusable bitfield: {}", self.addr, e);
                self.healthy = false;
            }
        }
    }

    /// While the remote chokes us and we have not yet said so, tell it we
    /// want its pieces.
    fn express_interest(&mut self) {
        if self.flags.peer_choking && !self.flags.am_interested {
            self.send_message(&Message::Interested);
            self.flags.am_interested = true;
        }
    }
}
