use crate::peer::message::Message;
use crate::peer::session::PeerSession;
use crate::picker::PiecePicker;
use crate::piece_manager::PieceManager;
use crate::stats::TransferStats;
use anyhow::anyhow;
use log::{debug, error, info};
use mio::{Events, Poll, Registry, Token};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// How long one readiness wait of the I/O worker may take.
const IO_WAIT: Duration = Duration::from_secs(1);
/// Pause between scheduler passes.
const REQUEST_TICK: Duration = Duration::from_millis(100);
/// Back-off while no peer will serve us.
const NO_PEERS_WAIT: Duration = Duration::from_secs(1);

/// The swarm: every live session, the index of who has which piece, and the
/// piece state. Both worker loops operate on this through one mutex.
pub struct PeerManager {
    sessions: HashMap<Token, PeerSession>,
    /// For each piece, the sessions known to have it; fed by BITFIELD and
    /// HAVE.
    peers_by_piece: Vec<Vec<Token>>,
    piece_manager: PieceManager,
    picker: Box<dyn PiecePicker>,
    stats: Arc<TransferStats>,
    next_token: usize,
}

impl PeerManager {
    pub fn new(
        piece_manager: PieceManager,
        picker: Box<dyn PiecePicker>,
        stats: Arc<TransferStats>,
    ) -> PeerManager {
        let peers_by_piece = vec![Vec::new(); piece_manager.number_of_pieces()];
        PeerManager {
            sessions: HashMap::new(),
            peers_by_piece,
            piece_manager,
            picker,
            stats,
            next_token: 0,
        }
    }

    pub fn add_session(&mut self, registry: &Registry, mut session: PeerSession) -> io::Result<()> {
        let token = Token(self.next_token);
        self.next_token += 1;
        session.register(registry, token)?;
        debug!("session {} registered as {:?}", session.addr, token);
        self.sessions.insert(token, session);
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_unchoked_peers(&self) -> bool {
        self.sessions.values().any(|s| s.is_unchoked())
    }

    pub fn unchoked_peers_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_unchoked()).count()
    }

    pub fn piece_manager(&self) -> &PieceManager {
        &self.piece_manager
    }

    /// Routes one parsed message to its reaction.
    fn handle_message(&mut self, token: Token, message: Message) {
        let Some(session) = self.sessions.get_mut(&token) else {
            return;
        };
        match message {
            Message::KeepAlive => {}
            Message::Choke => session.handle_choke(),
            Message::Unchoke => session.handle_unchoke(),
            Message::Interested => session.handle_interested(),
            Message::NotInterested => session.handle_not_interested(),
            Message::Have(index) => {
                session.handle_have(index);
                self.record_have(token, index);
            }
            Message::Bitfield(payload) => {
                session.handle_bitfield(&payload);
                let held: Vec<u32> = self.sessions[&token]
                    .bitfield
                    .pieces()
                    .into_iter()
                    .map(|i| i as u32)
                    .collect();
                for index in held {
                    self.record_have(token, index);
                }
            }
            Message::Request(index, begin, length) => {
                if session.is_interested() && session.am_unchoking() {
                    if let Some(block) = self.piece_manager.get_block(index, begin, length) {
                        session.send_message(&Message::Piece(index, begin, block));
                        self.stats.add_uploaded(length as u64);
                        info!("sent piece {} block to {}", index, session.addr);
                    }
                }
            }
            Message::Piece(index, offset, data) => {
                self.stats.add_downloaded(data.len() as u64);
                match self.piece_manager.on_block_received(index, offset, data) {
                    Ok(Some(completed)) => self.broadcast_have(completed),
                    Ok(None) => {}
                    Err(e) => error!("writing piece {} failed: {}", index, e),
                }
            }
            Message::Cancel(index, _, _) => {
                debug!("{}: ignoring cancel for piece {}", session.addr, index)
            }
            Message::Port(port) => debug!("{}: ignoring port announcement {}", session.addr, port),
        }
    }

    fn record_have(&mut self, token: Token, piece: u32) {
        let Some(holders) = self.peers_by_piece.get_mut(piece as usize) else {
            return;
        };
        if !holders.contains(&token) {
            holders.push(token);
            self.picker.on_peer_has(piece);
        }
    }

    /// Tells every session a piece just verified; ordered after finalization.
    fn broadcast_have(&mut self, piece: u32) {
        for session in self.sessions.values_mut() {
            session.send_message(&Message::Have(piece));
        }
    }

    /// Tears down every session that failed since the last sweep.
    fn remove_unhealthy(&mut self, registry: &Registry) {
        let dead: Vec<Token> = self
            .sessions
            .iter()
            .filter(|(_, s)| !s.is_healthy())
            .map(|(&t, _)| t)
            .collect();
        for token in dead {
            self.remove_session(registry, token);
        }
    }

    fn remove_session(&mut self, registry: &Registry, token: Token) {
        let Some(mut session) = self.sessions.remove(&token) else {
            return;
        };
        let _ = session.deregister(registry);
        session.close();
        let mut held = Vec::new();
        for (index, holders) in self.peers_by_piece.iter_mut().enumerate() {
            if let Some(at) = holders.iter().position(|&t| t == token) {
                holders.swap_remove(at);
                held.push(index as u32);
            }
        }
        self.picker.on_peer_gone(&held);
        info!("removed peer {}", session.addr);
    }

    /// A peer that has the piece, is serving us, is wanted, and is past its
    /// cooldown; picked at random among those.
    fn random_eligible_peer(&self, piece: u32) -> Option<Token> {
        let holders = self.peers_by_piece.get(piece as usize)?;
        let ready: Vec<Token> = holders
            .iter()
            .copied()
            .filter(|token| {
                self.sessions.get(token).is_some_and(|s| {
                    s.eligible()
                        && s.is_unchoked()
                        && s.am_interested()
                        && s.has_piece(piece as usize)
                })
            })
            .collect();
        ready.choose(&mut rand::thread_rng()).copied()
    }

    /// One scheduler pass: walk incomplete pieces in picker order, recycle
    /// stale blocks, and send at most one request per piece.
    fn request_pass(&mut self) {
        let order = self.picker.plan(self.piece_manager.pieces());
        for index in order {
            self.piece_manager.pieces_mut()[index as usize].update_block_status();
            let Some(token) = self.random_eligible_peer(index) else {
                continue;
            };
            let Some((piece_index, offset, length)) =
                self.piece_manager.pieces_mut()[index as usize].reserve_next_free_block()
            else {
                continue;
            };
            if let Some(session) = self.sessions.get_mut(&token) {
                session.send_message(&Message::Request(piece_index, offset, length));
            }
        }
    }

    /// Prints one progress line whenever the downloaded byte count moves.
    fn display_progress(&self, last: &mut Option<u64>) {
        let downloaded = self.piece_manager.bytes_downloaded();
        if *last == Some(downloaded) {
            return;
        }
        *last = Some(downloaded);

        let total = self.piece_manager.total_length().max(1);
        let percent = downloaded as f64 / total as f64 * 100.0;
        println!(
            "Connected peers: {} - {:.2}% completed | {}/{} pieces",
            self.unchoked_peers_count(),
            percent,
            self.piece_manager.completed_count(),
            self.piece_manager.number_of_pieces()
        );
    }
}

/// Runs the I/O worker and the request worker until every piece is on disk.
pub fn run(manager: PeerManager, poll: Poll) -> anyhow::Result<()> {
    let shared = Arc::new(Mutex::new(manager));
    let stop = Arc::new(AtomicBool::new(false));

    let io_shared = Arc::clone(&shared);
    let io_stop = Arc::clone(&stop);
    let io_worker = thread::Builder::new()
        .name("peer-io".to_string())
        .spawn(move || io_loop(io_shared, poll, io_stop))?;

    let request_shared = Arc::clone(&shared);
    let request_stop = Arc::clone(&stop);
    let request_worker = thread::Builder::new()
        .name("request".to_string())
        .spawn(move || request_loop(request_shared, request_stop))?;

    request_worker
        .join()
        .map_err(|_| anyhow!("request worker panicked"))??;
    io_worker
        .join()
        .map_err(|_| anyhow!("I/O worker panicked"))??;
    Ok(())
}

/// Waits for readable peer sockets, drains them, and routes every parsed
/// message. Sessions that fail are swept out each iteration.
fn io_loop(
    shared: Arc<Mutex<PeerManager>>,
    mut poll: Poll,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mut events = Events::with_capacity(128);
    while !stop.load(Ordering::SeqCst) {
        if let Err(e) = poll.poll(&mut events, Some(IO_WAIT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }

        let mut manager = shared.lock().expect("swarm state lock poisoned");
        for event in events.iter() {
            let token = event.token();
            let messages = match manager.sessions.get_mut(&token) {
                Some(session) => session.read_ready(),
                None => continue,
            };
            for message in messages {
                manager.handle_message(token, message);
            }
        }
        manager.remove_unhealthy(poll.registry());
    }
    Ok(())
}

/// Ticks every 100 ms, requesting one block per incomplete piece from a
/// random eligible peer. Ends once the download is complete.
fn request_loop(shared: Arc<Mutex<PeerManager>>, stop: Arc<AtomicBool>) -> anyhow::Result<()> {
    let mut last_progress = None;
    loop {
        if stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut manager = shared.lock().expect("swarm state lock poisoned");
            if manager.piece_manager.all_complete() {
                manager.display_progress(&mut last_progress);
                stop.store(true, Ordering::SeqCst);
                return Ok(());
            }
            if !manager.has_unchoked_peers() {
                drop(manager);
                info!("no unchoked peers");
                thread::sleep(NO_PEERS_WAIT);
                continue;
            }
            manager.request_pass();
            manager.display_progress(&mut last_progress);
        }
        thread::sleep(REQUEST_TICK);
    }
}
