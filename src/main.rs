use anyhow::Context;
use bitleech::peer::manager::{self, PeerManager};
use bitleech::picker::InOrder;
use bitleech::piece_manager::PieceManager;
use bitleech::stats::TransferStats;
use bitleech::torrent::Torrent;
use bitleech::tracker::{generate_peer_id, TrackerClient};
use clap::Parser;
use log::{info, warn};
use mio::Poll;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(about = "A leech-only BitTorrent v1 client")]
struct Cli {
    /// path to the *.torrent file
    file: PathBuf,
}

fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Cli::parse();

    let torrent = Torrent::from_path(&args.file)?;
    torrent.validate()?;
    let info_hash = torrent.info_hash()?;
    let peer_id = generate_peer_id();
    info!(
        "loaded {}: {} bytes in {} pieces",
        torrent.name(),
        torrent.total_length(),
        torrent.number_of_pieces()
    );

    let stats = Arc::new(TransferStats::new(torrent.total_length()));
    let piece_manager = PieceManager::new(&torrent).context("failed to lay out output files")?;

    let mut tracker = TrackerClient::new(info_hash, peer_id);
    tracker.gather(&torrent, &stats);
    let sessions = tracker.connect_peers(torrent.number_of_pieces());
    if sessions.is_empty() {
        warn!("no peer accepted a connection, waiting for nothing in particular");
    }

    let poll = Poll::new()?;
    let mut swarm = PeerManager::new(piece_manager, Box::new(InOrder), Arc::clone(&stats));
    for session in sessions {
        if let Err(e) = swarm.add_session(poll.registry(), session) {
            warn!("failed to register peer: {}", e);
        }
    }

    manager::run(swarm, poll)?;
    info!("File(s) downloaded successfully.");
    Ok(())
}
