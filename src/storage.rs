/*
src/storage.rs

Serializes verified pieces onto the on-disk file layout. Pieces complete in
whatever order the swarm delivers them, so every write seeks to its spot in
the torrent's linear byte space first; writes that straddle a file boundary
are split and the tail re-enqueued. The worker owns every open file handle
and nothing else touches them.
*/

use crossbeam::channel::{unbounded, Receiver, Sender};
use crossbeam::select;
use log::{debug, error};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create directory {path}: {source}")]
    Mkdir { path: PathBuf, source: io::Error },
    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to flush {path}: {source}")]
    Sync { path: PathBuf, source: io::Error },
    #[error("offset {0} is past the end of the torrent")]
    OffsetOutOfRange(u64),
    #[error("{path} is {got} bytes on disk, expected {expected}")]
    SizeMismatch {
        path: PathBuf,
        got: u64,
        expected: u64,
    },
}

/// One file of the torrent: path relative to the output root and its
/// declared length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    pub path: String,
    pub length: u64,
}

/// A write request at an offset in the torrent's linear byte space.
#[derive(Debug)]
pub struct StorageWork {
    pub data: Vec<u8>,
    pub offset: u64,
}

/// The coordinator's side of the worker: feed writes, signal completion.
pub struct StorageHandle {
    pub queue: Sender<StorageWork>,
    pub exit: Sender<()>,
}

pub struct StorageWorker {
    // zero-length spans are never opened, hence the Option
    files: Vec<Option<File>>,
    paths: Vec<PathBuf>,
    lengths: Vec<u64>,
    queue_tx: Sender<StorageWork>,
    queue_rx: Receiver<StorageWork>,
    exit_rx: Receiver<()>,
}

impl StorageWorker {
    /// Creates the output directory tree and opens every file for
    /// create+write with mode 0755.
    pub fn new(root: &Path, spans: &[FileSpan]) -> Result<(StorageWorker, StorageHandle), StorageError> {
        fs::create_dir_all(root).map_err(|source| StorageError::Mkdir {
            path: root.to_path_buf(),
            source,
        })?;

        let mut files = Vec::with_capacity(spans.len());
        let mut paths = Vec::with_capacity(spans.len());
        let mut lengths = Vec::with_capacity(spans.len());
        for span in spans {
            let path = root.join(&span.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|source| StorageError::Mkdir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            let file = if span.length == 0 {
                None
            } else {
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .mode(0o755)
                    .open(&path)
                    .map_err(|source| StorageError::Open {
                        path: path.clone(),
                        source,
                    })?;
                Some(file)
            };
            files.push(file);
            paths.push(path);
            lengths.push(span.length);
        }

        let (queue_tx, queue_rx) = unbounded();
        let (exit_tx, exit_rx) = unbounded();
        let handle = StorageHandle {
            queue: queue_tx.clone(),
            exit: exit_tx,
        };
        let worker = StorageWorker {
            files,
            paths,
            lengths,
            queue_tx,
            queue_rx,
            exit_rx,
        };
        Ok((worker, handle))
    }

    /// Runs until the exit signal, then drains the queue, flushes, and
    /// verifies every file's size on disk against its declared length.
    pub fn run(mut self) -> Result<(), StorageError> {
        let queue_rx = self.queue_rx.clone();
        let exit_rx = self.exit_rx.clone();
        loop {
            select! {
                recv(queue_rx) -> work => {
                    if let Ok(work) = work {
                        self.write(work);
                    }
                }
                recv(exit_rx) -> _ => {
                    while let Ok(work) = queue_rx.try_recv() {
                        self.write(work);
                    }
                    return self.finish();
                }
            }
        }
    }

    /// Locates the file containing a linear offset. Returns the offset
    /// within that file and the file's index.
    fn locate(&self, offset: u64) -> Result<(u64, usize), StorageError> {
        let mut cum = 0u64;
        for (i, len) in self.lengths.iter().enumerate() {
            if offset < cum + len {
                return Ok((offset - cum, i));
            }
            cum += len;
        }
        Err(StorageError::OffsetOutOfRange(offset))
    }

    fn write(&mut self, work: StorageWork) {
        let StorageWork { data, offset } = work;
        let (within, index) = match self.locate(offset) {
            Ok(found) => found,
            Err(err) => {
                error!("dropping write of {} bytes: {}", data.len(), err);
                return;
            }
        };
        // a located offset always lands in a nonempty span
        let Some(file) = self.files[index].as_mut() else {
            return;
        };

        // a write past the span boundary keeps the prefix here, the tail
        // goes back on the queue against the next file
        let split = ((self.lengths[index] - within) as usize).min(data.len());

        let result = file
            .seek(SeekFrom::Start(within))
            .and_then(|_| file.write_all(&data[..split]));
        if let Err(err) = result {
            error!(
                "write of {} bytes at offset {} failed, putting back in queue: {}",
                split, offset, err
            );
            let _ = self.queue_tx.send(StorageWork { data, offset });
            return;
        }
        debug!(
            "wrote {} bytes at offset {} into {}",
            split,
            offset,
            self.paths[index].display()
        );

        if split < data.len() {
            let _ = self.queue_tx.send(StorageWork {
                data: data[split..].to_vec(),
                offset: offset + split as u64,
            });
        }
    }

    fn finish(self) -> Result<(), StorageError> {
        for ((file, path), expected) in self.files.iter().zip(&self.paths).zip(&self.lengths) {
            let Some(file) = file else {
                continue;
            };
            file.sync_all().map_err(|source| StorageError::Sync {
                path: path.clone(),
                source,
            })?;
            let got = file
                .metadata()
                .map_err(|source| StorageError::Sync {
                    path: path.clone(),
                    source,
                })?
                .len();
            if got != *expected {
                return Err(StorageError::SizeMismatch {
                    path: path.clone(),
                    got,
                    expected: *expected,
                });
            }
            debug!("verified {} ({} bytes)", path.display(), got);
        }
        Ok(())
    }
}
