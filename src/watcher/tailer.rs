// SPDX-License-Identifier: Apache-2.0

//! Follow-with-rotation file tailer.
//!
//! Delivers appended lines from a single log file and survives the three
//! common rotation flavors: rename-then-recreate, truncate-in-place, and
//! delete-then-recreate after a delay. The reopen conditions are explicit;
//! at end-of-file the tailer re-stats the path and reopens from offset zero
//! only when
//!   - the path no longer exists (it then polls for recreation),
//!   - the path resolves to a different dev/ino than the open handle, or
//!   - the file is shorter than the current read offset (truncation).
//! Anything else at end-of-file means "no new data yet": sleep one poll
//! interval and read again.
//!
//! The first open seeks to end-of-file; history is never replayed. Lines are
//! decoded lossily, empty lines are delivered as zero-length items, and a
//! line whose newline has not been written yet is buffered until it
//! completes.

use std::io;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bounded_channel::BoundedSender;
use crate::watcher::file_id::FileId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("tail {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of one open-and-drain pass.
enum Pass {
    /// The file rotated away; reopen from offset zero.
    Rotated,
    /// Cancellation observed, or the line receiver went away.
    Done,
}

pub struct Tailer {
    path: PathBuf,
    poll_interval: Duration,
    start_at_end: bool,
    debug: bool,
}

impl Tailer {
    pub fn new(path: PathBuf, poll_interval: Duration, debug: bool) -> Self {
        Self {
            path,
            poll_interval,
            start_at_end: true,
            debug,
        }
    }

    /// Follow the file until cancellation or a fatal error, sending each
    /// complete line to `tx`.
    pub async fn run(mut self, cancel: CancellationToken, tx: BoundedSender<String>) -> Result<()> {
        loop {
            match self.follow(&cancel, &tx).await? {
                Pass::Rotated => {
                    if self.debug {
                        debug!(path = ?self.path, "reopening after rotation");
                    }
                }
                Pass::Done => return Ok(()),
            }
        }
    }

    /// Wait for the path to exist and open it. Returns None on cancellation.
    async fn open(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<(BufReader<File>, FileId, u64)>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            match std::fs::File::open(&self.path) {
                Ok(mut file) => {
                    let metadata = file.metadata().map_err(|e| self.err(e))?;
                    let file_id = FileId::from_metadata(&metadata);

                    let mut offset = 0u64;
                    if self.start_at_end {
                        offset = metadata.len();
                        file.seek(SeekFrom::Start(offset)).map_err(|e| self.err(e))?;
                    }
                    // only the very first open skips history
                    self.start_at_end = false;

                    if self.debug {
                        debug!(path = ?self.path, %file_id, offset, "tail started, waiting for lines");
                    }
                    return Ok(Some((BufReader::new(File::from_std(file)), file_id, offset)));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // wait for the file to appear rather than failing
                    select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => return Err(self.err(e)),
            }
        }
    }

    async fn follow(
        &mut self,
        cancel: &CancellationToken,
        tx: &BoundedSender<String>,
    ) -> Result<Pass> {
        let Some((mut reader, file_id, mut offset)) = self.open(cancel).await? else {
            return Ok(Pass::Done);
        };

        let mut buf: Vec<u8> = Vec::with_capacity(1024);
        let mut partial = String::new();

        loop {
            buf.clear();
            let n = select! {
                _ = cancel.cancelled() => return Ok(Pass::Done),
                res = reader.read_until(b'\n', &mut buf) => res.map_err(|e| self.err(e))?,
            };

            if n == 0 {
                // end of file: decide between waiting and reopening
                match tokio::fs::metadata(&self.path).await {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        if self.debug {
                            debug!(path = ?self.path, "file removed, waiting for recreation");
                        }
                        return Ok(Pass::Rotated);
                    }
                    Err(e) => return Err(self.err(e)),
                    Ok(metadata) => {
                        if FileId::from_metadata(&metadata) != file_id {
                            if self.debug {
                                debug!(path = ?self.path, "file replaced, reopening");
                            }
                            return Ok(Pass::Rotated);
                        }
                        if metadata.len() < offset {
                            if self.debug {
                                debug!(path = ?self.path, len = metadata.len(), offset,
                                    "file truncated, reopening");
                            }
                            return Ok(Pass::Rotated);
                        }
                        select! {
                            _ = cancel.cancelled() => return Ok(Pass::Done),
                            _ = sleep(self.poll_interval) => {}
                        }
                    }
                }
                continue;
            }

            offset += n as u64;

            if buf.last() != Some(&b'\n') {
                // the writer has not finished this line; hold what we have
                partial.push_str(&String::from_utf8_lossy(&buf));
                continue;
            }

            let mut text = String::from_utf8_lossy(&buf).into_owned();
            text.pop();
            if text.ends_with('\r') {
                text.pop();
            }

            let line = if partial.is_empty() {
                text
            } else {
                let mut full = std::mem::take(&mut partial);
                full.push_str(&text);
                full
            };

            if tx.send(line).await.is_err() {
                // downstream is gone, nothing left to deliver to
                return Ok(Pass::Done);
            }
        }
    }

    fn err(&self, source: io::Error) -> Error {
        Error::Io {
            path: self.path.clone(),
            source,
        }
    }
}
