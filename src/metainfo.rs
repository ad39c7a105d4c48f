use crate::storage::FileSpan;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaInfoError {
    #[error("failed to read torrent file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode torrent file: {0}")]
    Bencode(#[from] serde_bencode::Error),
    #[error("pieces length {0} is not a multiple of 20")]
    BadPieceHashes(usize),
    #[error("torrent lists no trackers")]
    NoTrackers,
}

/// a torrent is single xor multi file: `length` present means a lone file,
/// `files` present means a directory of them
#[derive(Debug, Deserialize, Serialize)]
struct FileDict {
    length: u64,
    path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    md5sum: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct Info {
    name: String,
    /// concatenation of all 20-byte SHA1 piece hashes (byte string, not urlencoded)
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    md5sum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    files: Option<Vec<FileDict>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private: Option<u8>,
}

#[derive(Debug, Deserialize, Serialize)]
struct TorrentFile {
    info: Info,
    #[serde(default)]
    announce: Option<String>,
    #[serde(default)]
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

/// The normalized descriptor everything downstream works from. Lives,
/// unchanged, for the whole run.
#[derive(Debug, Clone)]
pub struct MetaInfo {
    pub announce: Vec<String>,
    pub info_hash: [u8; 20],
    pub piece_hashes: Vec<[u8; 20]>,
    pub piece_length: usize,
    pub length: usize,
    pub name: String,
    pub files: Vec<FileSpan>,
    pub multi_file: bool,
}

impl MetaInfo {
    pub fn open(path: &Path) -> Result<MetaInfo, MetaInfoError> {
        let bytes = fs::read(path)?;
        MetaInfo::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<MetaInfo, MetaInfoError> {
        let tf: TorrentFile = serde_bencode::from_bytes(bytes)?;

        // flatten announce + announce-list into one ordered, deduplicated list
        let mut announce: Vec<String> = Vec::new();
        if let Some(url) = &tf.announce {
            announce.push(url.clone());
        }
        for tier in tf.announce_list.iter().flatten() {
            for url in tier {
                if !announce.contains(url) {
                    announce.push(url.clone());
                }
            }
        }
        if announce.is_empty() {
            return Err(MetaInfoError::NoTrackers);
        }

        // the info hash must cover the exact bytes of the source dictionary,
        // so the re-encode has to be canonical: sorted keys, absent keys omitted
        let encoded = serde_bencode::to_bytes(&tf.info)?;
        let info_hash: [u8; 20] = Sha1::digest(&encoded).into();

        let pieces: &[u8] = &tf.info.pieces;
        if pieces.len() % 20 != 0 {
            return Err(MetaInfoError::BadPieceHashes(pieces.len()));
        }
        let piece_hashes = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let multi_file = tf.info.files.is_some();
        let files: Vec<FileSpan> = match &tf.info.files {
            Some(files) => files
                .iter()
                .map(|f| FileSpan {
                    path: f.path.join("/"),
                    length: f.length,
                })
                .collect(),
            None => vec![FileSpan {
                path: tf.info.name.clone(),
                length: tf.info.length.unwrap_or(0),
            }],
        };
        let length = files.iter().map(|f| f.length).sum::<u64>() as usize;

        Ok(MetaInfo {
            announce,
            info_hash,
            piece_hashes,
            piece_length: tf.info.piece_length,
            length,
            name: tf.info.name,
            files,
            multi_file,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Where the files land: `<out>` itself for a single file torrent,
    /// `<out>/<name>/` for a multi file one.
    pub fn output_root(&self, out_dir: &Path) -> PathBuf {
        if self.multi_file {
            out_dir.join(&self.name)
        } else {
            out_dir.to_path_buf()
        }
    }
}
