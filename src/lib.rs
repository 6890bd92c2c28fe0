pub mod bitfield;
pub mod piece;
pub mod piece_manager;
pub mod picker;
pub mod stats;
pub mod torrent;
pub mod tracker;

pub mod peer {
    pub mod handshake;
    pub mod manager;
    pub mod message;
    pub mod session;
}
