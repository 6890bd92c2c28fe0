use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_bencode::{from_bytes, to_bytes};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::{Path, PathBuf};

/// One entry of a multi-file torrent's file list.
#[derive(Debug, Deserialize, Serialize)]
pub struct File {
    /// Path components below the torrent's root directory.
    pub path: Vec<String>,
    /// The length of the file in bytes (integer)
    pub length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Info {
    pub name: String,
    /// string consisting of the concatenation of all 20-byte SHA1 hash values, one per piece (byte string, i.e. not urlencoded)
    pub pieces: ByteBuf,
    /// number of bytes in each piece (integer)
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
    /// present for single-file torrents only
    #[serde(default)]
    pub length: Option<i64>,
    /// present for multi-file torrents only
    #[serde(default)]
    pub files: Option<Vec<File>>,
    #[serde(default)]
    pub private: Option<u8>,
}

/// A parsed `.torrent` metainfo descriptor.
#[derive(Debug, Deserialize)]
pub struct Torrent {
    pub info: Info,
    /// The announce URL of the tracker (string)
    #[serde(default)]
    announce: Option<String>,
    /// (optional) tiered tracker list, an extension to the official specification (list of lists of strings)
    #[serde(default)]
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,
    #[serde(rename = "comment")]
    comment: Option<String>,
    #[serde(default)]
    #[serde(rename = "created by")]
    created_by: Option<String>,
}

/// A file the download will produce, with its path relative to the working
/// directory and its declared length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub path: PathBuf,
    pub length: u64,
}

impl Torrent {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        from_bytes(bytes).context("failed to deserialize torrent")
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let mut file = std::fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Self::from_bytes(&buf)
    }

    /// SHA-1 of the bencoded `info` dictionary, the torrent's identity on the
    /// wire.
    pub fn info_hash(&self) -> anyhow::Result<[u8; 20]> {
        let bytes = to_bytes(&self.info).context("failed to re-encode info dictionary")?;
        Ok(Sha1::digest(bytes).into())
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn total_length(&self) -> u64 {
        if let Some(length) = self.info.length {
            length.max(0) as u64
        } else {
            self.info
                .files
                .iter()
                .flatten()
                .map(|f| f.length.max(0) as u64)
                .sum()
        }
    }

    pub fn piece_length(&self) -> u64 {
        self.info.piece_length.max(0) as u64
    }

    pub fn number_of_pieces(&self) -> usize {
        let piece_length = self.piece_length();
        if piece_length == 0 {
            return 0;
        }
        ((self.total_length() + piece_length - 1) / piece_length) as usize
    }

    /// The declared size of piece `index`; only the last piece may be short.
    pub fn piece_size(&self, index: usize) -> u64 {
        let count = self.number_of_pieces();
        if index + 1 == count {
            self.total_length() - (count as u64 - 1) * self.piece_length()
        } else {
            self.piece_length()
        }
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut array = [0u8; 20];
                array.copy_from_slice(chunk);
                array
            })
            .collect()
    }

    /// The tiered announce list; a torrent with only the legacy `announce`
    /// key yields a single one-element tier.
    pub fn announce_urls(&self) -> Vec<Vec<String>> {
        if let Some(list) = &self.announce_list {
            list.clone()
        } else if let Some(announce) = &self.announce {
            vec![vec![announce.clone()]]
        } else {
            Vec::new()
        }
    }

    /// The files the download produces, in metainfo order. A single-file
    /// torrent yields one file named after the torrent; a multi-file torrent
    /// nests its files beneath a root directory of that name.
    pub fn output_files(&self) -> Vec<OutputFile> {
        if let Some(files) = &self.info.files {
            files
                .iter()
                .map(|f| {
                    let mut path = PathBuf::from(&self.info.name);
                    for part in &f.path {
                        path.push(part);
                    }
                    OutputFile {
                        path,
                        length: f.length.max(0) as u64,
                    }
                })
                .collect()
        } else {
            vec![OutputFile {
                path: PathBuf::from(&self.info.name),
                length: self.total_length(),
            }]
        }
    }

    /// Rejects descriptors the engine cannot download from.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.total_length() == 0 {
            bail!("torrent has zero total length");
        }
        if self.output_files().is_empty() {
            bail!("torrent declares no files");
        }
        if self.info.pieces.len() != 20 * self.number_of_pieces() {
            bail!(
                "piece hash string holds {} bytes, expected {}",
                self.info.pieces.len(),
                20 * self.number_of_pieces()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent() -> Torrent {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d8:announce31:http://tracker.example/announce4:infod");
        raw.extend_from_slice(b"6:lengthi12e4:name5:hello12:piece lengthi16384e6:pieces20:");
        raw.extend_from_slice(&[0xabu8; 20]);
        raw.extend_from_slice(b"ee");
        Torrent::from_bytes(&raw).unwrap()
    }

    fn multi_file_torrent() -> Torrent {
        // two 20 KiB files, 16 KiB pieces -> three pieces
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d8:announce31:http://tracker.example/announce4:infod");
        raw.extend_from_slice(b"5:filesl");
        raw.extend_from_slice(b"d6:lengthi20480e4:pathl5:a.bineed6:lengthi20480e4:pathl5:b.binee");
        raw.extend_from_slice(b"e4:name4:data12:piece lengthi16384e6:pieces60:");
        raw.extend_from_slice(&[0xcdu8; 60]);
        raw.extend_from_slice(b"ee");
        Torrent::from_bytes(&raw).unwrap()
    }

    #[test]
    fn test_single_file_accessors() {
        let torrent = single_file_torrent();
        assert_eq!(torrent.name(), "hello");
        assert_eq!(torrent.total_length(), 12);
        assert_eq!(torrent.piece_length(), 16384);
        assert_eq!(torrent.number_of_pieces(), 1);
        assert_eq!(torrent.piece_size(0), 12);
        assert_eq!(torrent.piece_hashes(), vec![[0xab; 20]]);
        assert_eq!(
            torrent.announce_urls(),
            vec![vec!["http://tracker.example/announce".to_string()]]
        );
        assert_eq!(
            torrent.output_files(),
            vec![OutputFile {
                path: PathBuf::from("hello"),
                length: 12,
            }]
        );
        torrent.validate().unwrap();
    }

    #[test]
    fn test_multi_file_layout() {
        let torrent = multi_file_torrent();
        assert_eq!(torrent.total_length(), 40960);
        assert_eq!(torrent.number_of_pieces(), 3);
        assert_eq!(torrent.piece_size(0), 16384);
        assert_eq!(torrent.piece_size(2), 40960 - 2 * 16384);
        let files = torrent.output_files();
        assert_eq!(files[0].path, PathBuf::from("data").join("a.bin"));
        assert_eq!(files[1].path, PathBuf::from("data").join("b.bin"));
        assert_eq!(files[0].length, 20480);
        torrent.validate().unwrap();
    }

    #[test]
    fn test_info_hash_is_stable() {
        let torrent = single_file_torrent();
        let first = torrent.info_hash().unwrap();
        let second = torrent.info_hash().unwrap();
        assert_eq!(first, second);
        assert_ne!(first, [0u8; 20]);
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d4:infod6:lengthi0e4:name5:empty12:piece lengthi16384e6:pieces0:ee");
        let torrent = Torrent::from_bytes(&raw).unwrap();
        assert!(torrent.validate().is_err());
    }
}
