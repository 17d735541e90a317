// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Directory crawler: discovers which subdirectories of a log root contain
//! loggable files.
//!
//! Two interchangeable traversal strategies produce the same logical
//! `{run name -> file set}` result:
//!
//! - **Iterative glob**: globs one level deeper per pass (`root/*`,
//!   `root/*/*`, ...), short-circuiting once a level matches nothing and
//!   folding the pattern down to a literal prefix whenever all matches share
//!   a single parent. Preferred on storage tiers where one listing call is
//!   expensive.
//! - **Recursive listing**: a bounded pool of workers drains a shared queue
//!   of pending directories, pushing subdirectories back onto it. Workers
//!   terminate when the outstanding-work counter reaches zero, blocking on a
//!   condvar in the meantime; no idle-timeout polling.

use crate::fs::LogFs;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, warn};

/// Fixed substring convention marking loggable files.
pub const LOG_FILE_MARKER: &str = "logseg";

/// Whether a path looks like a loggable file, judged by its file name.
pub fn is_log_file(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().contains(LOG_FILE_MARKER))
        .unwrap_or(false)
}

/// `{run name -> set of loggable file paths}`.
pub type RunListing = BTreeMap<String, BTreeSet<PathBuf>>;

/// Cross-cycle crawl state for one log root.
///
/// Owned by the caller and passed into every crawl; runs accumulate
/// append-only (a run observed once is never dropped, even if its directory
/// later stops matching).
#[derive(Debug, Default)]
pub struct CrawlState {
    runs: RunListing,
}

impl CrawlState {
    pub fn runs(&self) -> &RunListing {
        &self.runs
    }
}

/// Crawls one log root.
pub struct Crawler {
    fs: Arc<dyn LogFs>,
    root: PathBuf,
    workers: usize,
}

impl Crawler {
    pub fn new(fs: Arc<dyn LogFs>, root: impl Into<PathBuf>, workers: usize) -> Self {
        Self {
            fs,
            root: root.into(),
            workers: workers.max(1),
        }
    }

    /// Refreshes `state` with the current contents of the log root.
    ///
    /// A missing root is not an error; the producer may simply not have
    /// started writing yet.
    pub fn crawl(&self, state: &mut CrawlState) -> io::Result<()> {
        if !self.fs.exists(&self.root) {
            return Ok(());
        }
        if !self.fs.is_dir(&self.root) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("log root {} is not a directory", self.root.display()),
            ));
        }

        let listed = if self.fs.prefers_glob() {
            self.crawl_via_glob()?
        } else {
            self.crawl_via_listing()
        };

        for (dir, candidates) in listed {
            let log_files: BTreeSet<PathBuf> = candidates
                .into_iter()
                .filter(|path| is_log_file(path) && !self.fs.is_dir(path))
                .collect();
            if log_files.is_empty() {
                continue;
            }
            state
                .runs
                .entry(self.run_name(&dir))
                .or_default()
                .extend(log_files);
        }
        Ok(())
    }

    /// Run name of a directory: its path relative to the root, or `.` for
    /// the root itself.
    fn run_name(&self, dir: &Path) -> String {
        match dir.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => dir.to_string_lossy().into_owned(),
        }
    }

    /// Iterative-glob traversal: one glob per directory depth.
    fn crawl_via_glob(&self) -> io::Result<Vec<(PathBuf, Vec<PathBuf>)>> {
        let mut results: Vec<(PathBuf, Vec<PathBuf>)> = Vec::new();
        let mut pattern = self.root.join("*");
        let mut level = 0u32;

        loop {
            let matches = self.fs.glob(&pattern)?;
            debug!("glob level {level} matched {} paths", matches.len());
            if matches.is_empty() {
                // This depth has nothing; nothing deeper can exist either.
                return Ok(results);
            }

            let mut by_parent: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
            for path in matches {
                let parent = path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.root.clone());
                by_parent.entry(parent).or_default().push(path);
            }

            // Once every current match shares a single parent, fold the
            // wildcard prefix down to that literal path so already-resolved
            // subtrees are not re-walked.
            if by_parent.len() == 1 {
                if let Some(parent) = by_parent.keys().next() {
                    pattern = parent.join("*");
                }
            }

            results.extend(by_parent);
            pattern = pattern.join("*");
            level += 1;
        }
    }

    /// Recursive-listing traversal via a bounded worker pool.
    ///
    /// `outstanding` counts directories enqueued but not yet fully processed;
    /// it is incremented on enqueue and decremented after a directory's
    /// children have been recorded, so a worker observing an empty queue with
    /// `outstanding == 0` knows no peer can produce more work.
    #[allow(clippy::expect_used)]
    fn crawl_via_listing(&self) -> Vec<(PathBuf, Vec<PathBuf>)> {
        struct WorkState {
            queue: VecDeque<PathBuf>,
            outstanding: usize,
        }

        let work = Mutex::new(WorkState {
            queue: VecDeque::from([self.root.clone()]),
            outstanding: 1,
        });
        let work_available = Condvar::new();
        let results: Mutex<Vec<(PathBuf, Vec<PathBuf>)>> = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..self.workers {
                scope.spawn(|| loop {
                    let dir = {
                        let mut state = work.lock().expect("crawler lock poisoned");
                        loop {
                            if let Some(dir) = state.queue.pop_front() {
                                break Some(dir);
                            }
                            if state.outstanding == 0 {
                                break None;
                            }
                            state = work_available
                                .wait(state)
                                .expect("crawler lock poisoned");
                        }
                    };
                    let Some(dir) = dir else {
                        return;
                    };

                    match self.fs.list_dir(&dir) {
                        Ok(children) => {
                            let mut files = Vec::new();
                            let mut subdirs = Vec::new();
                            for child in children {
                                if self.fs.is_dir(&child) {
                                    subdirs.push(child);
                                } else {
                                    files.push(child);
                                }
                            }
                            if !subdirs.is_empty() {
                                let mut state = work.lock().expect("crawler lock poisoned");
                                state.outstanding += subdirs.len();
                                state.queue.extend(subdirs);
                                drop(state);
                                work_available.notify_all();
                            }
                            results
                                .lock()
                                .expect("crawler lock poisoned")
                                .push((dir, files));
                        }
                        Err(err) => {
                            // Transient listing failures heal on the next
                            // cycle; the subtree is simply not descended now.
                            warn!("failed to list {}: {err}", dir.display());
                        }
                    }

                    let mut state = work.lock().expect("crawler lock poisoned");
                    state.outstanding -= 1;
                    if state.outstanding == 0 {
                        drop(state);
                        work_available.notify_all();
                    }
                });
            }
        });

        results.into_inner().expect("crawler lock poisoned")
    }
}
