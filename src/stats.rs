use std::sync::atomic::{AtomicU64, Ordering};

/// Transfer counters reported to trackers: bytes uploaded, bytes verified as
/// downloaded, and bytes still missing.
#[derive(Debug)]
pub struct TransferStats {
    total_length: u64,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
}

impl TransferStats {
    pub fn new(total_length: u64) -> TransferStats {
        TransferStats {
            total_length,
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
        }
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn left(&self) -> u64 {
        self.total_length.saturating_sub(self.downloaded())
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }
}
