// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Chunked streaming of large binary payloads.
//!
//! Blobs bypass the scalar batcher entirely: each one is registered with the
//! server (idempotently), then streamed as fixed-size checksummed chunks with
//! the last chunk finalizing the transfer. The chunk stream itself is never
//! retried; a failed stream is dropped and the server discards the partial
//! blob when a later transfer re-registers the same coordinate.

use crate::error::MirrorError;
use crate::rate_limiter::RateLimiter;
use crate::rpc::{
    call_with_retry, CreateBlobRequest, RetryStrategy, RpcError, WriteBlobChunk, WriteService,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Streams one blob at a time to the write service.
pub struct BlobUploader {
    service: Arc<dyn WriteService>,
    limiter: Arc<Mutex<RateLimiter>>,
    retry: RetryStrategy,
    session_id: String,
    chunk_bytes: usize,
    /// Guards against interleaving two transfers on one uploader.
    in_flight: Option<(String, String)>,
}

impl BlobUploader {
    pub fn new(
        service: Arc<dyn WriteService>,
        limiter: Arc<Mutex<RateLimiter>>,
        retry: RetryStrategy,
        session_id: String,
        chunk_bytes: usize,
    ) -> Self {
        Self {
            service,
            limiter,
            retry,
            session_id,
            chunk_bytes,
            in_flight: None,
        }
    }

    /// Registers and streams one blob. Transient failures drop the blob with
    /// a warning; a missing session stops the upload.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_blob(
        &mut self,
        run: &str,
        tag: &str,
        step: i64,
        wall_time: f64,
        metadata: Option<&str>,
        data: &[u8],
    ) -> Result<(), MirrorError> {
        if let Some((flight_run, flight_tag)) = &self.in_flight {
            return Err(MirrorError::BlobInFlight {
                run: flight_run.clone(),
                tag: flight_tag.clone(),
            });
        }
        self.in_flight = Some((run.to_string(), tag.to_string()));
        let result = self
            .transfer(run, tag, step, wall_time, metadata, data)
            .await;
        self.in_flight = None;
        result
    }

    async fn transfer(
        &mut self,
        run: &str,
        tag: &str,
        step: i64,
        wall_time: f64,
        metadata: Option<&str>,
        data: &[u8],
    ) -> Result<(), MirrorError> {
        let request = CreateBlobRequest {
            session_id: self.session_id.clone(),
            run: run.to_string(),
            tag: tag.to_string(),
            step,
            wall_time,
            metadata: metadata.map(ToString::to_string),
        };

        self.limiter.lock().await.tick().await;
        let service = Arc::clone(&self.service);
        let blob_id = match call_with_retry(self.retry, || {
            let service = Arc::clone(&service);
            let request = request.clone();
            async move { service.get_or_create_blob(request).await }
        })
        .await
        {
            Ok(response) => response.blob_id,
            Err(RpcError::NotFound(_)) => {
                return Err(MirrorError::SessionNotFound(self.session_id.clone()))
            }
            Err(err) => {
                warn!("dropping blob {tag:?} in run {run:?}: {err}");
                return Ok(());
            }
        };

        let chunks = chunk_blob(&blob_id, data, self.chunk_bytes);
        let bytes = data.len();
        let started = Instant::now();
        self.limiter.lock().await.tick().await;
        match self.service.write_blob(chunks).await {
            Ok(()) => {
                info!(
                    "shipped blob {tag:?} in run {run:?}: {bytes} bytes in {:?}",
                    started.elapsed()
                );
                Ok(())
            }
            Err(RpcError::NotFound(_)) => {
                Err(MirrorError::SessionNotFound(self.session_id.clone()))
            }
            Err(err) => {
                warn!("dropping blob {tag:?} in run {run:?} mid-stream: {err}");
                Ok(())
            }
        }
    }
}

/// Splits `data` into checksummed chunks of at most `chunk_bytes`. An empty
/// blob still produces one zero-length finalizing chunk so the server can
/// mark the transfer complete.
fn chunk_blob(blob_id: &str, data: &[u8], chunk_bytes: usize) -> Vec<WriteBlobChunk> {
    let mut chunks = Vec::new();
    let mut offset = 0usize;
    loop {
        let end = (offset + chunk_bytes).min(data.len());
        let slice = &data[offset..end];
        let finalize = end == data.len();
        chunks.push(WriteBlobChunk {
            blob_id: blob_id.to_string(),
            offset: offset as u64,
            data: slice.to_vec(),
            crc32: crc32fast::hash(slice),
            finalize,
        });
        if finalize {
            break;
        }
        offset = end;
    }
    chunks
}
