// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Record-oriented reader that tails one append-only log file.
//!
//! The file may still be growing while it is read. `read_next` only ever
//! returns complete, checksum-valid records; a trailing partial write is left
//! unconsumed and re-attempted on the next call. The durable cursor advances
//! only past records actually returned, so resuming at the cursor yields the
//! same records a single continuous read would have produced.

use crate::fs::{LogFs, ReadToken};
use crate::record::{decode_frame, FrameOutcome, RecordEvent};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Bytes fetched from the filesystem per read call.
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Tails one append-only file and yields complete decoded records.
pub struct RecordReader {
    fs: Arc<dyn LogFs>,
    path: PathBuf,
    /// Durable cursor: offset of the first byte not yet consumed into a
    /// returned record. Monotonically non-decreasing.
    cursor: u64,
    /// Bytes fetched beyond the cursor that have not yet resolved into
    /// returned records.
    buf: Vec<u8>,
    token: ReadToken,
}

impl RecordReader {
    /// Reader starting at the beginning of `path`.
    pub fn new(fs: Arc<dyn LogFs>, path: impl Into<PathBuf>) -> Self {
        Self::resume(fs, path, 0)
    }

    /// Reader resuming at a durable byte cursor from an earlier instance.
    pub fn resume(fs: Arc<dyn LogFs>, path: impl Into<PathBuf>, cursor: u64) -> Self {
        Self {
            fs,
            path: path.into(),
            cursor,
            buf: Vec::new(),
            token: ReadToken::at_offset(cursor),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the first byte not yet consumed into a returned record.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Offset up to which file bytes have been fetched. Anything on disk
    /// beyond this is data the reader has not seen yet.
    pub fn fetched_offset(&self) -> u64 {
        self.cursor + self.buf.len() as u64
    }

    /// Returns the next complete record, or `None` once all currently
    /// available data has been consumed (two consecutive empty reads with no
    /// error). Corrupt or partial trailing bytes are never an error; they
    /// simply stop resolving into records until the writer finishes them.
    pub fn read_next(&mut self) -> io::Result<Option<RecordEvent>> {
        let mut empty_reads = 0u32;
        loop {
            match decode_frame(&self.buf) {
                FrameOutcome::Complete { payload, consumed } => {
                    self.buf.drain(..consumed);
                    self.cursor += consumed as u64;
                    match RecordEvent::from_payload(&payload) {
                        Ok(event) => return Ok(Some(event)),
                        Err(err) => {
                            // The frame checksummed clean but the payload is
                            // not a record; the writer produced garbage, not
                            // a partial flush. Skip it.
                            warn!(
                                "skipping undecodable record at offset {} in {}: {err}",
                                self.cursor - consumed as u64,
                                self.path.display()
                            );
                        }
                    }
                }
                FrameOutcome::Incomplete => {
                    if empty_reads >= 2 {
                        return Ok(None);
                    }
                    let (bytes, next) =
                        self.fs
                            .read(&self.path, Some(READ_CHUNK_BYTES), Some(self.token))?;
                    self.token = next;
                    if bytes.is_empty() {
                        empty_reads += 1;
                    } else {
                        empty_reads = 0;
                        self.buf.extend_from_slice(&bytes);
                    }
                }
            }
        }
    }
}
