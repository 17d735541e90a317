// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Run tracker: owns the per-run reading state across upload cycles.
//!
//! Each discovered run holds an ordered list of source files (creation order,
//! oldest first) with a durable read cursor each. Draining a run yields every
//! record appended since the previous drain, strictly file-by-file in order.
//! Files that have been fully read and have gone quiet are marked exhausted
//! and skipped on later cycles, unless they grow again.

use crate::crawler::{Crawler, CrawlState};
use crate::fs::LogFs;
use crate::reader::RecordReader;
use crate::record::RecordEvent;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// One file within a run.
struct SourceFile {
    path: PathBuf,
    reader: RecordReader,
    /// Fully read and gone quiet; cleared again if the file grows.
    exhausted: bool,
    /// Last observed modification time.
    modified: Option<SystemTime>,
}

impl SourceFile {
    fn new(fs: Arc<dyn LogFs>, path: PathBuf) -> Self {
        let reader = RecordReader::new(fs, path.clone());
        Self {
            path,
            reader,
            exhausted: false,
            modified: None,
        }
    }

    fn is_stale(&self, window: Duration) -> bool {
        match self.modified {
            Some(modified) => SystemTime::now()
                .duration_since(modified)
                .map(|age| age >= window)
                .unwrap_or(false),
            None => false,
        }
    }
}

/// One logical subdirectory of the log root.
pub struct RunDirectory {
    name: String,
    files: Vec<SourceFile>,
    active: bool,
}

impl RunDirectory {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether any file of this run was modified within the recency window.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Reads everything appended since the last drain, oldest file first.
    /// Transient per-file read failures are logged and heal on a later cycle.
    fn drain(&mut self, window: Duration) -> Vec<RecordEvent> {
        let mut events = Vec::new();
        let file_count = self.files.len();
        for (idx, file) in self.files.iter_mut().enumerate() {
            if file.exhausted {
                continue;
            }
            loop {
                match file.reader.read_next() {
                    Ok(Some(event)) => events.push(event),
                    Ok(None) => break,
                    Err(err) => {
                        warn!(
                            "transient read failure on {}: {err}",
                            file.path.display()
                        );
                        break;
                    }
                }
            }
            // Retire fully-read files that are not the newest in the run and
            // have gone quiet. The newest file stays open: it is where new
            // appends land.
            let newest = idx + 1 == file_count;
            if !newest && file.is_stale(window) {
                file.exhausted = true;
            }
        }
        events
    }
}

/// Tracks every run under one log root.
pub struct RunTracker {
    fs: Arc<dyn LogFs>,
    crawler: Crawler,
    crawl_state: CrawlState,
    runs: BTreeMap<String, RunDirectory>,
    inactive_window: Duration,
}

impl RunTracker {
    pub fn new(
        fs: Arc<dyn LogFs>,
        root: impl Into<PathBuf>,
        crawl_workers: usize,
        inactive_window: Duration,
    ) -> Self {
        let root = root.into();
        let crawler = Crawler::new(Arc::clone(&fs), root, crawl_workers);
        Self {
            fs,
            crawler,
            crawl_state: CrawlState::default(),
            runs: BTreeMap::new(),
            inactive_window,
        }
    }

    /// Re-crawls the log root, registers newly discovered runs and files, and
    /// recomputes activity flags from file modification times.
    pub fn synchronize(&mut self) -> io::Result<()> {
        self.crawler.crawl(&mut self.crawl_state)?;

        for (run_name, paths) in self.crawl_state.runs() {
            let run = self
                .runs
                .entry(run_name.clone())
                .or_insert_with(|| RunDirectory {
                    name: run_name.clone(),
                    files: Vec::new(),
                    active: true,
                });
            // BTreeSet iteration is ordered, so files enter the list in
            // creation (name) order and keep their rank forever after.
            for path in paths {
                if run.files.iter().all(|file| &file.path != path) {
                    debug!("discovered file {} in run {run_name}", path.display());
                    run.files
                        .push(SourceFile::new(Arc::clone(&self.fs), path.clone()));
                }
            }
        }

        self.refresh_activity();
        Ok(())
    }

    fn refresh_activity(&mut self) {
        let now = SystemTime::now();
        for run in self.runs.values_mut() {
            let mut any_recent = false;
            for file in &mut run.files {
                match self.fs.stat(&file.path) {
                    Ok(stat) => {
                        // A file that grew past what we already fetched has
                        // been appended to again; un-retire it.
                        if stat.size > file.reader.fetched_offset() {
                            file.exhausted = false;
                        }
                        file.modified = Some(stat.modified);
                        let recent = now
                            .duration_since(stat.modified)
                            .map(|age| age < self.inactive_window)
                            .unwrap_or(true);
                        any_recent = any_recent || recent;
                    }
                    Err(err) => {
                        warn!("failed to stat {}: {err}", file.path.display());
                    }
                }
            }
            run.active = any_recent;
        }
    }

    /// Drains every run (or only active runs), returning `(run name, events)`
    /// pairs for runs that yielded records.
    pub fn drain_all(&mut self, include_inactive: bool) -> Vec<(String, Vec<RecordEvent>)> {
        let window = self.inactive_window;
        self.runs
            .values_mut()
            .filter(|run| include_inactive || run.active)
            .map(|run| (run.name.clone(), run.drain(window)))
            .filter(|(_, events)| !events.is_empty())
            .collect()
    }

    pub fn runs(&self) -> impl Iterator<Item = &RunDirectory> {
        self.runs.values()
    }
}
