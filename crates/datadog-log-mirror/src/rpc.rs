// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote write-service boundary.
//!
//! The mirror never talks to a transport directly; it goes through the
//! [`WriteService`] trait so the intake client can be swapped out (and mocked
//! in tests). Wire types are plain serde structs; the concrete client decides
//! the encoding on the wire.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport-level failure of a remote call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The referenced entity does not exist on the server. Not retryable.
    #[error("not found: {0}")]
    NotFound(String),

    /// The server rejected the request as malformed. Not retryable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Connection-level or availability failure. Retryable.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl RpcError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Transient(_))
    }
}

/// Retry policy for unary remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Retry immediately, up to the given number of attempts.
    Immediate(u32),
    /// Fixed delay in milliseconds between attempts.
    LinearBackoff(u32, u64),
    /// Delay in milliseconds doubling after each attempt.
    ExponentialBackoff(u32, u64),
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::LinearBackoff(5, 250)
    }
}

impl RetryStrategy {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryStrategy::Immediate(attempts)
            | RetryStrategy::LinearBackoff(attempts, _)
            | RetryStrategy::ExponentialBackoff(attempts, _) => (*attempts).max(1),
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::LinearBackoff(_, millis) => Duration::from_millis(*millis),
            RetryStrategy::ExponentialBackoff(_, millis) => {
                Duration::from_millis(millis.saturating_mul(1u64 << attempt.min(16)))
            }
        }
    }
}

/// Runs `call` until it succeeds, returns a non-retryable error, or the
/// strategy's attempt budget is spent.
pub async fn call_with_retry<T, F, Fut>(strategy: RetryStrategy, mut call: F) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RpcError>>,
{
    let attempts = strategy.attempts();
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                tracing::debug!("retrying remote call after attempt {attempt}: {err}");
                tokio::time::sleep(strategy.delay(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub log_root: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteSessionRequest {
    pub session_id: String,
}

/// One structured write: every scalar point accumulated since the last
/// flush, grouped by run and tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatchRequest {
    pub session_id: String,
    pub runs: Vec<RunBatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunBatch {
    pub name: String,
    pub tags: Vec<TagBatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagBatch {
    pub name: String,
    #[serde(default)]
    pub metadata: Option<String>,
    pub points: Vec<ScalarPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarPoint {
    pub step: i64,
    pub wall_time: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateBlobRequest {
    pub session_id: String,
    pub run: String,
    pub tag: String,
    pub step: i64,
    pub wall_time: f64,
    #[serde(default)]
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateBlobResponse {
    pub blob_id: String,
}

/// One chunk of a streamed blob transfer. Offsets are byte positions within
/// the blob; the final chunk carries `finalize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteBlobChunk {
    pub blob_id: String,
    pub offset: u64,
    pub data: Vec<u8>,
    pub crc32: u32,
    pub finalize: bool,
}

/// Capability object over the remote intake.
#[async_trait]
pub trait WriteService: Send + Sync {
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse, RpcError>;

    async fn delete_session(&self, request: DeleteSessionRequest) -> Result<(), RpcError>;

    async fn write_batch(&self, request: WriteBatchRequest) -> Result<(), RpcError>;

    /// Returns the blob id for the (session, run, tag, step) coordinate,
    /// creating the blob record if it does not exist. Idempotent.
    async fn get_or_create_blob(
        &self,
        request: CreateBlobRequest,
    ) -> Result<CreateBlobResponse, RpcError>;

    /// Streams an ordered sequence of chunks for one blob. Not idempotent;
    /// callers must not blindly retry a failed stream.
    async fn write_blob(&self, chunks: Vec<WriteBlobChunk>) -> Result<(), RpcError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// In-memory [`WriteService`] that records every call and pops scripted
    /// failures front-first before succeeding.
    #[derive(Default)]
    pub(crate) struct RecordingService {
        pub batches: Mutex<Vec<WriteBatchRequest>>,
        pub blob_requests: Mutex<Vec<CreateBlobRequest>>,
        pub streams: Mutex<Vec<Vec<WriteBlobChunk>>>,
        pub deleted_sessions: Mutex<Vec<String>>,
        pub batch_failures: Mutex<VecDeque<RpcError>>,
        pub blob_failures: Mutex<VecDeque<RpcError>>,
        pub stream_failures: Mutex<VecDeque<RpcError>>,
    }

    #[async_trait]
    impl WriteService for RecordingService {
        async fn create_session(
            &self,
            _request: CreateSessionRequest,
        ) -> Result<CreateSessionResponse, RpcError> {
            Ok(CreateSessionResponse {
                session_id: "sess-1".to_string(),
            })
        }

        async fn delete_session(&self, request: DeleteSessionRequest) -> Result<(), RpcError> {
            self.deleted_sessions.lock().unwrap().push(request.session_id);
            Ok(())
        }

        async fn write_batch(&self, request: WriteBatchRequest) -> Result<(), RpcError> {
            if let Some(err) = self.batch_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.batches.lock().unwrap().push(request);
            Ok(())
        }

        async fn get_or_create_blob(
            &self,
            request: CreateBlobRequest,
        ) -> Result<CreateBlobResponse, RpcError> {
            if let Some(err) = self.blob_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            let mut requests = self.blob_requests.lock().unwrap();
            requests.push(request);
            Ok(CreateBlobResponse {
                blob_id: format!("blob-{}", requests.len()),
            })
        }

        async fn write_blob(&self, chunks: Vec<WriteBlobChunk>) -> Result<(), RpcError> {
            if let Some(err) = self.stream_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.streams.lock().unwrap().push(chunks);
            Ok(())
        }
    }
}
