use log::{debug, warn};
use sha1::{Digest, Sha1};
use std::fs::OpenOptions;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Transfer granularity of Request/Piece messages.
pub const BLOCK_SIZE: u32 = 16384;

/// How long a requested block may stay unanswered before it is handed out
/// again.
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum BlockState {
    Free,
    Pending { since: Instant },
    Full(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Nominal size; every block is 16 KiB except possibly the last of the
    /// last piece.
    pub size: u32,
    pub state: BlockState,
}

impl Block {
    fn new(size: u32) -> Block {
        Block {
            size,
            state: BlockState::Free,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self.state, BlockState::Full(_))
    }
}

/// Where a slice of a piece lands on disk. A piece may span several files and
/// a file several pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    pub path: PathBuf,
    /// Byte offset within the target file.
    pub file_offset: u64,
    /// Byte offset within the piece.
    pub piece_offset: usize,
    pub length: usize,
}

#[derive(Debug)]
pub struct Piece {
    pub index: u32,
    /// Declared total size in bytes.
    pub size: u64,
    /// Declared SHA-1 digest from the metainfo.
    pub hash: [u8; 20],
    blocks: Vec<Block>,
    spans: Vec<FileSpan>,
    complete: bool,
    /// Assembled bytes, kept after verification to answer outbound requests.
    raw_data: Vec<u8>,
}

impl Piece {
    pub fn new(index: u32, size: u64, hash: [u8; 20]) -> Piece {
        let mut piece = Piece {
            index,
            size,
            hash,
            blocks: Vec::new(),
            spans: Vec::new(),
            complete: false,
            raw_data: Vec::new(),
        };
        piece.init_blocks();
        piece
    }

    fn init_blocks(&mut self) {
        let count = ((self.size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64).max(1) as usize;
        self.blocks = (0..count).map(|_| Block::new(BLOCK_SIZE)).collect();
        let remainder = (self.size % BLOCK_SIZE as u64) as u32;
        if remainder != 0 {
            self.blocks[count - 1].size = remainder;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn number_of_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn add_span(&mut self, span: FileSpan) {
        self.spans.push(span);
    }

    pub fn spans(&self) -> &[FileSpan] {
        &self.spans
    }

    /// Returns any block that has been pending longer than the timeout to the
    /// free pool.
    pub fn update_block_status(&mut self) {
        for block in &mut self.blocks {
            if let BlockState::Pending { since } = block.state {
                if since.elapsed() > PENDING_TIMEOUT {
                    debug!("piece {}: reclaiming a stale pending block", self.index);
                    block.state = BlockState::Free;
                }
            }
        }
    }

    /// Marks the first FREE block pending and returns its request
    /// coordinates: (piece index, byte offset within the piece, length).
    pub fn reserve_next_free_block(&mut self) -> Option<(u32, u32, u32)> {
        if self.complete {
            return None;
        }
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if block.state == BlockState::Free {
                block.state = BlockState::Pending {
                    since: Instant::now(),
                };
                return Some((self.index, i as u32 * BLOCK_SIZE, block.size));
            }
        }
        None
    }

    /// Stores a received block payload. Duplicate or late deliveries are
    /// ignored, as are payloads that do not match the block's declared size.
    pub fn receive(&mut self, offset: u32, data: Vec<u8>) {
        if self.complete {
            return;
        }
        let index = (offset / BLOCK_SIZE) as usize;
        let Some(block) = self.blocks.get_mut(index) else {
            warn!(
                "piece {}: block offset {} is out of range, dropping",
                self.index, offset
            );
            return;
        };
        if block.is_full() {
            return;
        }
        if data.len() != block.size as usize {
            warn!(
                "piece {}: got {} bytes for a {}-byte block, dropping",
                self.index,
                data.len(),
                block.size
            );
            return;
        }
        block.state = BlockState::Full(data);
    }

    pub fn all_blocks_full(&self) -> bool {
        self.blocks.iter().all(|b| b.is_full())
    }

    /// Assembles the blocks, verifies the SHA-1 digest and, on success,
    /// writes the piece to disk and marks it complete. On a digest mismatch
    /// every block is reset to FREE so the piece is downloaded again.
    pub fn finalize(&mut self) -> io::Result<bool> {
        let data = self.merge_blocks();
        let digest: [u8; 20] = Sha1::digest(&data).into();
        if digest != self.hash {
            warn!("piece {}: hash mismatch, resetting blocks", self.index);
            self.init_blocks();
            return Ok(false);
        }

        self.raw_data = data;
        self.write_to_disk()?;
        self.complete = true;
        debug!("piece {}: verified and written", self.index);
        Ok(true)
    }

    /// A slice of the verified piece, for answering an outbound request.
    pub fn get_block(&self, begin: u32, length: u32) -> Option<&[u8]> {
        if !self.complete {
            return None;
        }
        self.raw_data
            .get(begin as usize..begin as usize + length as usize)
    }

    /// Bytes held in FULL blocks, for progress accounting.
    pub fn bytes_downloaded(&self) -> u64 {
        self.blocks
            .iter()
            .map(|b| match &b.state {
                BlockState::Full(data) => data.len() as u64,
                _ => 0,
            })
            .sum()
    }

    fn merge_blocks(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size as usize);
        for block in &self.blocks {
            if let BlockState::Full(data) = &block.state {
                buf.extend_from_slice(data);
            }
        }
        buf
    }

    fn write_to_disk(&self) -> io::Result<()> {
        for span in &self.spans {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&span.path)?;
            // seeking past EOF then writing zero-fills the gap, so pieces may
            // land in any order
            file.seek(SeekFrom::Start(span.file_offset))?;
            file.write_all(&self.raw_data[span.piece_offset..span.piece_offset + span.length])?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn age_pending_blocks(&mut self, by: Duration) {
        for block in &mut self.blocks {
            if let BlockState::Pending { since } = &mut block.state {
                *since -= by;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sha1_of(data: &[u8]) -> [u8; 20] {
        Sha1::digest(data).into()
    }

    #[test]
    fn test_block_layout_small_piece() {
        // a piece no larger than one block holds exactly one block of its size
        let piece = Piece::new(0, 12, [0; 20]);
        assert_eq!(piece.number_of_blocks(), 1);
        assert_eq!(piece.blocks[0].size, 12);
    }

    #[test]
    fn test_block_layout_with_remainder() {
        let piece = Piece::new(0, BLOCK_SIZE as u64 * 2 + 100, [0; 20]);
        assert_eq!(piece.number_of_blocks(), 3);
        assert_eq!(piece.blocks[0].size, BLOCK_SIZE);
        assert_eq!(piece.blocks[1].size, BLOCK_SIZE);
        assert_eq!(piece.blocks[2].size, 100);
    }

    #[test]
    fn test_block_layout_exact_multiple() {
        let piece = Piece::new(0, BLOCK_SIZE as u64 * 2, [0; 20]);
        assert_eq!(piece.number_of_blocks(), 2);
        assert_eq!(piece.blocks[1].size, BLOCK_SIZE);
    }

    #[test]
    fn test_reserve_walks_blocks_in_order() {
        let mut piece = Piece::new(3, BLOCK_SIZE as u64 * 2 + 1, [0; 20]);
        assert_eq!(
            piece.reserve_next_free_block(),
            Some((3, 0, BLOCK_SIZE))
        );
        assert_eq!(
            piece.reserve_next_free_block(),
            Some((3, BLOCK_SIZE, BLOCK_SIZE))
        );
        assert_eq!(
            piece.reserve_next_free_block(),
            Some((3, BLOCK_SIZE * 2, 1))
        );
        assert_eq!(piece.reserve_next_free_block(), None);
    }

    #[test]
    fn test_pending_timeout_reclaims_block() {
        let mut piece = Piece::new(0, 100, [0; 20]);
        piece.reserve_next_free_block().unwrap();
        piece.update_block_status();
        // still pending, nothing to hand out
        assert_eq!(piece.reserve_next_free_block(), None);

        piece.age_pending_blocks(PENDING_TIMEOUT + Duration::from_secs(1));
        piece.update_block_status();
        assert_eq!(piece.reserve_next_free_block(), Some((0, 0, 100)));
    }

    #[test]
    fn test_receive_ignores_duplicates_and_bad_sizes() {
        let mut piece = Piece::new(0, 100, [0; 20]);
        piece.receive(0, vec![1; 100]);
        assert!(piece.all_blocks_full());
        // a late duplicate does not overwrite
        piece.receive(0, vec![2; 100]);
        assert_eq!(piece.blocks[0].state, BlockState::Full(vec![1; 100]));

        let mut piece = Piece::new(0, 100, [0; 20]);
        piece.receive(0, vec![1; 50]);
        assert!(!piece.all_blocks_full());
        // out-of-range offset is dropped, not a panic
        piece.receive(BLOCK_SIZE * 5, vec![1; 100]);
    }

    #[test]
    fn test_finalize_writes_spans() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"hello world!";
        let mut piece = Piece::new(0, content.len() as u64, sha1_of(content));
        piece.add_span(FileSpan {
            path: dir.path().join("hello"),
            file_offset: 0,
            piece_offset: 0,
            length: content.len(),
        });

        piece.receive(0, content.to_vec());
        assert!(piece.all_blocks_full());
        assert!(piece.finalize().unwrap());
        assert!(piece.is_complete());
        assert_eq!(fs::read(dir.path().join("hello")).unwrap(), content);
        assert_eq!(piece.get_block(6, 6).unwrap(), b"world!");
        assert_eq!(piece.get_block(0, 5).unwrap(), b"hello");
        assert!(piece.get_block(6, 7).is_none());
    }

    #[test]
    fn test_finalize_seeks_past_eof() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![7u8; 64];
        let mut piece = Piece::new(1, 64, sha1_of(&content));
        piece.add_span(FileSpan {
            path: dir.path().join("sparse"),
            file_offset: 128,
            piece_offset: 0,
            length: 64,
        });
        piece.receive(0, content.clone());
        assert!(piece.finalize().unwrap());

        let written = fs::read(dir.path().join("sparse")).unwrap();
        assert_eq!(written.len(), 192);
        assert_eq!(&written[..128], &[0u8; 128]);
        assert_eq!(&written[128..], &content[..]);
    }

    #[test]
    fn test_hash_mismatch_resets_blocks() {
        let content = b"good bytes";
        let mut piece = Piece::new(5, content.len() as u64, sha1_of(content));
        piece.receive(0, b"bad bytes!".to_vec());
        assert!(piece.all_blocks_full());
        assert!(!piece.finalize().unwrap());
        assert!(!piece.is_complete());
        assert_eq!(piece.bytes_downloaded(), 0);

        // redelivery of the right bytes completes the piece
        piece.receive(0, content.to_vec());
        assert!(piece.finalize().unwrap());
        assert_eq!(piece.bytes_downloaded(), content.len() as u64);
    }
}
