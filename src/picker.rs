use crate::piece::Piece;

/// Decides the order in which incomplete pieces are tried on each request
/// pass. The engine runs the in-order picker; `RarestFirst` keeps the same
/// interface so it can be swapped in without touching the scheduler.
pub trait PiecePicker: Send {
    /// Incomplete piece indices in preferred order for one pass.
    fn plan(&self, pieces: &[Piece]) -> Vec<u32>;

    /// A peer announced possession of a piece (via HAVE or BITFIELD).
    fn on_peer_has(&mut self, _piece: u32) {}

    /// A peer left the swarm while holding these pieces.
    fn on_peer_gone(&mut self, _pieces: &[u32]) {}
}

/// Attempts pieces strictly by ascending index.
#[derive(Debug, Default)]
pub struct InOrder;

impl PiecePicker for InOrder {
    fn plan(&self, pieces: &[Piece]) -> Vec<u32> {
        pieces
            .iter()
            .filter(|p| !p.is_complete())
            .map(|p| p.index)
            .collect()
    }
}

/// Orders pieces by how few peers hold them. Not wired up yet.
#[derive(Debug)]
pub struct RarestFirst {
    availability: Vec<u32>,
}

impl RarestFirst {
    pub fn new(number_of_pieces: usize) -> RarestFirst {
        RarestFirst {
            availability: vec![0; number_of_pieces],
        }
    }

    pub fn availability(&self, piece: u32) -> u32 {
        self.availability
            .get(piece as usize)
            .copied()
            .unwrap_or(0)
    }
}

impl PiecePicker for RarestFirst {
    fn plan(&self, pieces: &[Piece]) -> Vec<u32> {
        let mut order: Vec<u32> = pieces
            .iter()
            .filter(|p| !p.is_complete())
            .map(|p| p.index)
            .collect();
        order.sort_by_key(|&i| (self.availability(i), i));
        order
    }

    fn on_peer_has(&mut self, piece: u32) {
        if let Some(count) = self.availability.get_mut(piece as usize) {
            *count += 1;
        }
    }

    fn on_peer_gone(&mut self, pieces: &[u32]) {
        for &piece in pieces {
            if let Some(count) = self.availability.get_mut(piece as usize) {
                *count = count.saturating_sub(1);
            }
        }
    }
}
