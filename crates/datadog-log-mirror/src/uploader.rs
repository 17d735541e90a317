// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The mirroring agent: discovers runs, drains new records and routes them to
//! the scalar batcher or the blob uploader, one cycle at a time.

use crate::batcher::ScalarBatcher;
use crate::blobs::BlobUploader;
use crate::config::MirrorConfig;
use crate::error::MirrorError;
use crate::fs::LogFs;
use crate::rate_limiter::RateLimiter;
use crate::record::RecordPayload;
use crate::rpc::{
    call_with_retry, CreateSessionRequest, DeleteSessionRequest, RpcError, ScalarPoint,
    WriteService,
};
use crate::tracker::RunTracker;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Runs that have gone quiet are still re-drained every this-many cycles, so
/// a straggling writer that resumes after a long pause is not missed.
const INACTIVE_DRAIN_INTERVAL: u64 = 5;

struct Session {
    id: String,
    scalars: ScalarBatcher,
    blobs: BlobUploader,
}

/// Mirrors one log root into a remote write service.
///
/// All outbound calls made on behalf of one mirror share a single rate
/// limiter, so scalar batches and blob chunks together respect the configured
/// minimum call spacing.
pub struct LogDirMirror {
    config: MirrorConfig,
    service: Arc<dyn WriteService>,
    root: PathBuf,
    tracker: RunTracker,
    limiter: Arc<Mutex<RateLimiter>>,
    poll_limiter: RateLimiter,
    session: Option<Session>,
    cycle: u64,
}

impl LogDirMirror {
    pub fn new(
        config: MirrorConfig,
        fs: Arc<dyn LogFs>,
        service: Arc<dyn WriteService>,
        root: impl Into<PathBuf>,
    ) -> Result<Self, MirrorError> {
        config.validate()?;
        let root = root.into();
        let tracker = RunTracker::new(
            Arc::clone(&fs),
            root.clone(),
            config.crawl_workers,
            config.inactive_window(),
        );
        let limiter = Arc::new(Mutex::new(RateLimiter::new(config.min_rpc_interval())));
        let poll_limiter = RateLimiter::new(config.min_rpc_interval());
        Ok(Self {
            config,
            service,
            root,
            tracker,
            limiter,
            poll_limiter,
            session: None,
            cycle: 0,
        })
    }

    /// Registers a new upload session with the server. Must be called once
    /// before [`run_once`](Self::run_once).
    pub async fn create_session(&mut self) -> Result<String, MirrorError> {
        let request = CreateSessionRequest {
            log_root: self.root.to_string_lossy().into_owned(),
        };
        let service = Arc::clone(&self.service);
        let response = call_with_retry(self.config.retry_strategy, || {
            let service = Arc::clone(&service);
            let request = request.clone();
            async move { service.create_session(request).await }
        })
        .await?;

        info!("created upload session {}", response.session_id);
        let scalars = ScalarBatcher::new(
            Arc::clone(&self.service),
            Arc::clone(&self.limiter),
            self.config.retry_strategy,
            response.session_id.clone(),
            self.config.max_request_bytes,
        )?;
        let blobs = BlobUploader::new(
            Arc::clone(&self.service),
            Arc::clone(&self.limiter),
            self.config.retry_strategy,
            response.session_id.clone(),
            self.config.blob_chunk_bytes,
        );
        self.session = Some(Session {
            id: response.session_id.clone(),
            scalars,
            blobs,
        });
        Ok(response.session_id)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.id.as_str())
    }

    /// Deletes the server-side session and forgets it locally.
    pub async fn delete_session(&mut self) -> Result<(), MirrorError> {
        let session = self.session.take().ok_or(MirrorError::SessionNotStarted)?;
        let request = DeleteSessionRequest {
            session_id: session.id.clone(),
        };
        let service = Arc::clone(&self.service);
        let result = call_with_retry(self.config.retry_strategy, || {
            let service = Arc::clone(&service);
            let request = request.clone();
            async move { service.delete_session(request).await }
        })
        .await;
        match result {
            Ok(()) => {
                info!("deleted upload session {}", session.id);
                Ok(())
            }
            Err(RpcError::NotFound(_)) => Err(MirrorError::SessionNotFound(session.id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Mirrors forever, pacing cycles through the poll limiter. Returns only
    /// on a fatal error.
    pub async fn run(&mut self) -> Result<(), MirrorError> {
        loop {
            self.poll_limiter.tick().await;
            self.run_once().await?;
        }
    }

    /// One full cycle: re-crawl the log root, drain every (active) run and
    /// ship what came out. Filesystem trouble skips the cycle; it heals on a
    /// later one.
    pub async fn run_once(&mut self) -> Result<(), MirrorError> {
        let session = self.session.as_mut().ok_or(MirrorError::SessionNotStarted)?;
        self.cycle += 1;

        let started = std::time::Instant::now();
        if let Err(err) = self.tracker.synchronize() {
            warn!("skipping cycle {}: crawl failed: {err}", self.cycle);
            return Ok(());
        }

        let include_inactive = self.cycle % INACTIVE_DRAIN_INTERVAL == 1;
        let drained = self.tracker.drain_all(include_inactive);
        let records: usize = drained.iter().map(|(_, events)| events.len()).sum();
        debug!(
            "cycle {}: {} records from {} runs in {:?} (inactive runs {})",
            self.cycle,
            records,
            drained.len(),
            started.elapsed(),
            if include_inactive { "included" } else { "skipped" },
        );

        for (run, events) in drained {
            for event in events {
                match event.payload {
                    RecordPayload::Scalar {
                        tag,
                        value,
                        metadata,
                    } => {
                        session
                            .scalars
                            .add_point(
                                &run,
                                &tag,
                                metadata.as_deref(),
                                ScalarPoint {
                                    step: event.step,
                                    wall_time: event.wall_time,
                                    value,
                                },
                            )
                            .await?;
                    }
                    RecordPayload::Blob {
                        tag,
                        data,
                        metadata,
                    } => {
                        session
                            .blobs
                            .send_blob(
                                &run,
                                &tag,
                                event.step,
                                event.wall_time,
                                metadata.as_deref(),
                                &data,
                            )
                            .await?;
                    }
                }
            }
        }

        session.scalars.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFs;
    use crate::record::RecordEvent;
    use crate::rpc::testing::RecordingService;
    use std::fs;
    use std::io::Write;
    use std::path::Path;
    use tempfile::tempdir;

    fn config() -> MirrorConfig {
        MirrorConfig {
            min_rpc_interval_secs: 0,
            ..Default::default()
        }
    }

    fn scalar(step: i64, tag: &str, value: f64) -> RecordEvent {
        RecordEvent {
            step,
            wall_time: step as f64,
            payload: RecordPayload::Scalar {
                tag: tag.to_string(),
                value,
                metadata: None,
            },
        }
    }

    fn blob(step: i64, tag: &str, data: &[u8]) -> RecordEvent {
        RecordEvent {
            step,
            wall_time: step as f64,
            payload: RecordPayload::Blob {
                tag: tag.to_string(),
                data: data.to_vec(),
                metadata: None,
            },
        }
    }

    fn append_event(path: &Path, event: &RecordEvent) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(&event.to_frame().unwrap()).unwrap();
    }

    fn mirror_with(
        config: MirrorConfig,
        root: &Path,
        service: Arc<RecordingService>,
    ) -> LogDirMirror {
        LogDirMirror::new(config, Arc::new(LocalFs), service, root).unwrap()
    }

    fn mirror_for(root: &Path, service: Arc<RecordingService>) -> LogDirMirror {
        mirror_with(config(), root, service)
    }

    #[tokio::test]
    async fn upload_requires_a_session() {
        let temp = tempdir().unwrap();
        let service = Arc::new(RecordingService::default());
        let mut mirror = mirror_for(temp.path(), service);
        assert!(matches!(
            mirror.run_once().await,
            Err(MirrorError::SessionNotStarted)
        ));
    }

    #[tokio::test]
    async fn scalars_are_mirrored_per_run() {
        let temp = tempdir().unwrap();
        append_event(
            &temp.path().join("train").join("0001.logseg"),
            &scalar(1, "loss", 0.5),
        );
        append_event(
            &temp.path().join("eval").join("0001.logseg"),
            &scalar(1, "loss", 0.7),
        );

        let service = Arc::new(RecordingService::default());
        let mut mirror = mirror_for(temp.path(), Arc::clone(&service));
        assert_eq!(mirror.create_session().await.unwrap(), "sess-1");
        mirror.run_once().await.unwrap();

        let batches = service.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let names: Vec<&str> = batches[0].runs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["eval", "train"]);
        assert_eq!(batches[0].runs[1].tags[0].points[0].value, 0.5);
    }

    #[tokio::test]
    async fn blobs_bypass_the_batcher() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("train").join("0001.logseg");
        append_event(&file, &scalar(1, "loss", 0.5));
        append_event(&file, &blob(1, "graph", b"graph-bytes"));

        let service = Arc::new(RecordingService::default());
        let mut mirror = mirror_for(temp.path(), Arc::clone(&service));
        mirror.create_session().await.unwrap();
        mirror.run_once().await.unwrap();

        assert_eq!(service.batches.lock().unwrap().len(), 1);
        let streams = service.streams.lock().unwrap();
        assert_eq!(streams.len(), 1);
        let total: Vec<u8> = streams[0]
            .iter()
            .flat_map(|chunk| chunk.data.clone())
            .collect();
        assert_eq!(total, b"graph-bytes");
    }

    #[tokio::test]
    async fn quiet_cycles_send_nothing() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("train").join("0001.logseg");
        append_event(&file, &scalar(1, "loss", 0.5));

        let service = Arc::new(RecordingService::default());
        let mut mirror = mirror_for(temp.path(), Arc::clone(&service));
        mirror.create_session().await.unwrap();
        mirror.run_once().await.unwrap();
        mirror.run_once().await.unwrap();
        assert_eq!(service.batches.lock().unwrap().len(), 1);

        append_event(&file, &scalar(2, "loss", 0.4));
        mirror.run_once().await.unwrap();
        assert_eq!(service.batches.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn inactive_runs_drain_only_periodically() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("train").join("0001.logseg");
        append_event(&file, &scalar(1, "loss", 0.5));

        // Zero-width window: the run is inactive from the start, so only the
        // periodic inclusive cycle picks it up.
        let mut cfg = config();
        cfg.inactive_file_secs = 0;
        let service = Arc::new(RecordingService::default());
        let mut mirror = mirror_with(cfg, temp.path(), Arc::clone(&service));
        mirror.create_session().await.unwrap();

        // Cycle 1 is an inclusive cycle.
        mirror.run_once().await.unwrap();
        assert_eq!(service.batches.lock().unwrap().len(), 1);

        // Data written while the run is inactive waits for the next
        // inclusive cycle (cycle 6).
        append_event(&file, &scalar(2, "loss", 0.4));
        for _ in 0..4 {
            mirror.run_once().await.unwrap();
        }
        assert_eq!(service.batches.lock().unwrap().len(), 1);
        mirror.run_once().await.unwrap();
        assert_eq!(service.batches.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_session_tears_down() {
        let temp = tempdir().unwrap();
        let service = Arc::new(RecordingService::default());
        let mut mirror = mirror_for(temp.path(), Arc::clone(&service));
        mirror.create_session().await.unwrap();
        assert_eq!(mirror.session_id(), Some("sess-1"));

        mirror.delete_session().await.unwrap();
        assert_eq!(mirror.session_id(), None);
        assert_eq!(
            *service.deleted_sessions.lock().unwrap(),
            vec!["sess-1".to_string()]
        );
        assert!(matches!(
            mirror.run_once().await,
            Err(MirrorError::SessionNotStarted)
        ));
    }

    #[tokio::test]
    async fn missing_root_is_not_fatal() {
        let temp = tempdir().unwrap();
        let service = Arc::new(RecordingService::default());
        let mut mirror = mirror_for(&temp.path().join("nope"), Arc::clone(&service));
        mirror.create_session().await.unwrap();
        mirror.run_once().await.unwrap();
        assert!(service.batches.lock().unwrap().is_empty());
    }
}
