// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Filesystem capability boundary.
//!
//! Log roots can live on local disk or on storage tiers with very different
//! cost profiles (object stores where one listing call is expensive, where
//! seeking is not cheap). Everything above this module talks to a
//! [`LogFs`] object; [`LocalFs`] is the local-disk implementation.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Opaque continuation token for [`LogFs::read`].
///
/// Lets a reader resume mid-stream without re-reading from offset zero on
/// backends that cannot cheaply seek. Tokens are only meaningful for the
/// (filesystem, path) pair that produced them; a fresh stream can be opened
/// at a durable byte offset with [`ReadToken::at_offset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadToken {
    offset: u64,
}

impl ReadToken {
    /// Token positioned at an absolute byte offset.
    pub fn at_offset(offset: u64) -> Self {
        Self { offset }
    }

    /// Byte offset of the next read.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Size and modification time of a file.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: u64,
    pub modified: SystemTime,
}

/// Capability object over the storage tier holding the log root.
pub trait LogFs: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    /// Lists the direct children of `dir` as full paths.
    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    /// Expands a pattern whose components are either literals or a lone `*`
    /// matching any single path component. Matches may be files or
    /// directories; a missing prefix yields an empty result.
    fn glob(&self, pattern: &Path) -> io::Result<Vec<PathBuf>>;

    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// Reads up to `max_bytes` (or to end-of-file when `None`) starting at
    /// `from` (start of file when `None`). Returns the bytes read and the
    /// continuation token for the following read. Reading at end-of-file is
    /// not an error; it returns an empty buffer.
    fn read(
        &self,
        path: &Path,
        max_bytes: Option<usize>,
        from: Option<ReadToken>,
    ) -> io::Result<(Vec<u8>, ReadToken)>;

    /// Whether a single listing call is expensive enough on this tier that
    /// the crawler should prefer the iterative-glob strategy.
    fn prefers_glob(&self) -> bool {
        false
    }
}

/// Local-disk implementation of [`LogFs`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl LogFs for LocalFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut children = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            children.push(entry?.path());
        }
        children.sort();
        Ok(children)
    }

    fn glob(&self, pattern: &Path) -> io::Result<Vec<PathBuf>> {
        let mut current = vec![PathBuf::new()];
        for component in pattern.components() {
            if component.as_os_str() == "*" {
                let mut next = Vec::new();
                for base in &current {
                    let Ok(entries) = std::fs::read_dir(base) else {
                        // A base may have been removed mid-walk or not be a
                        // directory at all; either way it has no children.
                        continue;
                    };
                    for entry in entries.flatten() {
                        next.push(entry.path());
                    }
                }
                current = next;
            } else {
                for base in &mut current {
                    base.push(component);
                }
                current.retain(|path| path.exists());
            }
        }
        current.sort();
        Ok(current)
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let metadata = std::fs::metadata(path)?;
        Ok(FileStat {
            size: metadata.len(),
            modified: metadata.modified()?,
        })
    }

    fn read(
        &self,
        path: &Path,
        max_bytes: Option<usize>,
        from: Option<ReadToken>,
    ) -> io::Result<(Vec<u8>, ReadToken)> {
        let start = from.map(|token| token.offset()).unwrap_or(0);
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(start))?;

        let mut buf = Vec::new();
        match max_bytes {
            Some(limit) => {
                file.take(limit as u64).read_to_end(&mut buf)?;
            }
            None => {
                file.read_to_end(&mut buf)?;
            }
        }
        let next = ReadToken::at_offset(start + buf.len() as u64);
        Ok((buf, next))
    }
}
