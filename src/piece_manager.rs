use crate::bitfield::BitField;
use crate::piece::{FileSpan, Piece};
use crate::torrent::{OutputFile, Torrent};
use anyhow::Context;
use log::warn;
use std::io;

/// Owns every piece, the local bitfield and the file-layout map; all disk
/// I/O for downloaded content goes through here.
#[derive(Debug)]
pub struct PieceManager {
    pieces: Vec<Piece>,
    bitfield: BitField,
    completed: usize,
    total_length: u64,
}

impl PieceManager {
    pub fn new(torrent: &Torrent) -> anyhow::Result<PieceManager> {
        let hashes = torrent.piece_hashes();
        let pieces = hashes
            .into_iter()
            .enumerate()
            .map(|(i, hash)| Piece::new(i as u32, torrent.piece_size(i), hash))
            .collect();
        Self::from_parts(pieces, &torrent.output_files())
    }

    /// Builds the manager from explicit pieces and output files; the sweep
    /// walks piece indices over the file list so that a piece may span
    /// several files and a file several pieces.
    pub fn from_parts(mut pieces: Vec<Piece>, files: &[OutputFile]) -> anyhow::Result<PieceManager> {
        let count = pieces.len();

        let mut torrent_offset: u64 = 0;
        let mut piece_used: u64 = 0;
        for file in files {
            if let Some(parent) = file.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
            }

            let mut remaining = file.length;
            let mut file_offset: u64 = 0;
            while remaining > 0 {
                let id = Self::piece_at(&pieces, torrent_offset);
                let available = pieces[id].size - piece_used;
                let take = remaining.min(available);
                pieces[id].add_span(FileSpan {
                    path: file.path.clone(),
                    file_offset,
                    piece_offset: piece_used as usize,
                    length: take as usize,
                });
                torrent_offset += take;
                file_offset += take;
                remaining -= take;
                piece_used = if take == available { 0 } else { piece_used + take };
            }
        }

        let total_length = pieces.iter().map(|p| p.size).sum();
        Ok(PieceManager {
            pieces,
            bitfield: BitField::new(count),
            completed: 0,
            total_length,
        })
    }

    fn piece_at(pieces: &[Piece], torrent_offset: u64) -> usize {
        let mut offset = 0;
        for (i, piece) in pieces.iter().enumerate() {
            offset += piece.size;
            if torrent_offset < offset {
                return i;
            }
        }
        pieces.len().saturating_sub(1)
    }

    /// Routes a received block to its piece; when that fills the piece, the
    /// piece is verified and written. Returns the piece index when a piece
    /// just completed.
    pub fn on_block_received(
        &mut self,
        index: u32,
        offset: u32,
        data: Vec<u8>,
    ) -> io::Result<Option<u32>> {
        let Some(piece) = self.pieces.get_mut(index as usize) else {
            warn!("dropping block for unknown piece {}", index);
            return Ok(None);
        };
        if piece.is_complete() {
            return Ok(None);
        }
        piece.receive(offset, data);
        if piece.all_blocks_full() && piece.finalize()? {
            self.completed += 1;
            self.bitfield.set(index as usize);
            return Ok(Some(index));
        }
        Ok(None)
    }

    /// Bytes of a verified piece, for answering an outbound request. Returns
    /// nothing while the piece is incomplete.
    pub fn get_block(&self, index: u32, begin: u32, length: u32) -> Option<Vec<u8>> {
        self.pieces
            .get(index as usize)?
            .get_block(begin, length)
            .map(|b| b.to_vec())
    }

    pub fn all_complete(&self) -> bool {
        self.completed == self.pieces.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed
    }

    pub fn number_of_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.pieces.iter().map(|p| p.bytes_downloaded()).sum()
    }

    pub fn bitfield(&self) -> &BitField {
        &self.bitfield
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn pieces_mut(&mut self) -> &mut [Piece] {
        &mut self.pieces
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};
    use std::fs;
    use std::path::PathBuf;

    fn sha1_of(data: &[u8]) -> [u8; 20] {
        Sha1::digest(data).into()
    }

    fn kib(n: usize) -> u64 {
        n as u64 * 1024
    }

    #[test]
    fn test_span_sweep_two_files_three_pieces() {
        // files A and B of 20 KiB with 16 KiB pieces; piece 1 straddles the
        // file boundary
        let pieces = vec![
            Piece::new(0, kib(16), [0; 20]),
            Piece::new(1, kib(16), [0; 20]),
            Piece::new(2, kib(8), [0; 20]),
        ];
        let files = vec![
            OutputFile {
                path: PathBuf::from("a.bin"),
                length: kib(20),
            },
            OutputFile {
                path: PathBuf::from("b.bin"),
                length: kib(20),
            },
        ];
        let manager = PieceManager::from_parts(pieces, &files).unwrap();

        let piece0 = manager.pieces()[0].spans();
        assert_eq!(piece0.len(), 1);
        assert_eq!(piece0[0].path, PathBuf::from("a.bin"));
        assert_eq!((piece0[0].file_offset, piece0[0].piece_offset, piece0[0].length),
            (0, 0, kib(16) as usize));

        let piece1 = manager.pieces()[1].spans();
        assert_eq!(piece1.len(), 2);
        assert_eq!(piece1[0].path, PathBuf::from("a.bin"));
        assert_eq!((piece1[0].file_offset, piece1[0].piece_offset, piece1[0].length),
            (kib(16), 0, kib(4) as usize));
        assert_eq!(piece1[1].path, PathBuf::from("b.bin"));
        assert_eq!((piece1[1].file_offset, piece1[1].piece_offset, piece1[1].length),
            (0, kib(4) as usize, kib(12) as usize));

        let piece2 = manager.pieces()[2].spans();
        assert_eq!(piece2.len(), 1);
        assert_eq!(piece2[0].path, PathBuf::from("b.bin"));
        assert_eq!((piece2[0].file_offset, piece2[0].piece_offset, piece2[0].length),
            (kib(12), 0, kib(8) as usize));

        // spans partition each piece contiguously and add up to the total
        let total: usize = manager
            .pieces()
            .iter()
            .flat_map(|p| p.spans())
            .map(|s| s.length)
            .sum();
        assert_eq!(total as u64, kib(40));
        for piece in manager.pieces() {
            let mut expected_offset = 0;
            for span in piece.spans() {
                assert_eq!(span.piece_offset, expected_offset);
                expected_offset += span.length;
            }
            assert_eq!(expected_offset as u64, piece.size);
        }
    }

    #[test]
    fn test_out_of_order_completion_across_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let a_path = dir.path().join("a");
        let b_path = dir.path().join("b");

        // 12 bytes total, two files of 6, piece length 8
        let content_a = b"aaaaaa";
        let content_b = b"bbbbbb";
        let piece0: Vec<u8> = [&content_a[..], &content_b[..2]].concat();
        let piece1: Vec<u8> = content_b[2..].to_vec();

        let pieces = vec![
            Piece::new(0, 8, sha1_of(&piece0)),
            Piece::new(1, 4, sha1_of(&piece1)),
        ];
        let files = vec![
            OutputFile {
                path: a_path.clone(),
                length: 6,
            },
            OutputFile {
                path: b_path.clone(),
                length: 6,
            },
        ];
        let mut manager = PieceManager::from_parts(pieces, &files).unwrap();

        // the later piece lands first
        assert_eq!(manager.on_block_received(1, 0, piece1).unwrap(), Some(1));
        assert!(manager.bitfield().has_piece(1));
        assert!(!manager.all_complete());

        assert_eq!(manager.on_block_received(0, 0, piece0).unwrap(), Some(0));
        assert!(manager.all_complete());
        assert_eq!(manager.completed_count(), 2);

        assert_eq!(fs::read(&a_path).unwrap(), content_a);
        assert_eq!(fs::read(&b_path).unwrap(), content_b);

        // completed pieces answer block reads, incomplete ranges do not
        assert_eq!(manager.get_block(0, 6, 2).unwrap(), b"bb");
        assert!(manager.get_block(0, 7, 2).is_none());
    }

    #[test]
    fn test_block_for_unknown_piece_is_dropped() {
        let pieces = vec![Piece::new(0, 4, [0; 20])];
        let files = vec![OutputFile {
            path: PathBuf::from("x"),
            length: 4,
        }];
        let mut manager = PieceManager::from_parts(pieces, &files).unwrap();
        assert_eq!(manager.on_block_received(9, 0, vec![1, 2]).unwrap(), None);
        assert_eq!(manager.bytes_downloaded(), 0);
    }
}
