// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Size-bounded batching of scalar points into write requests.
//!
//! Points accumulate into one in-progress [`WriteBatchRequest`], grouped by
//! run and tag, under an exact serialized-size budget. Every add is costed
//! against the budget before it mutates the request, so the request can be
//! shipped at any moment without re-checking its size.

use crate::error::MirrorError;
use crate::rate_limiter::RateLimiter;
use crate::rpc::{
    call_with_retry, RetryStrategy, RpcError, RunBatch, ScalarPoint, TagBatch, WriteBatchRequest,
    WriteService,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Worst-case length-prefix cost charged when a new run or tag container is
/// opened. Containers grow after they are costed, so the final prefix length
/// is unknown at that point; charging the maximum keeps the budget sound.
const MAX_VARINT_LENGTH_BYTES: usize = 10;

/// Result of attempting to fit a point into the in-progress request.
#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// The point does not fit next to what is already buffered; flush and
    /// try again.
    NeedsFlush,
}

fn encoded_len<T: Serialize>(value: &T) -> Result<usize, MirrorError> {
    Ok(rmp_serde::to_vec(value)?.len())
}

fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Accumulates scalar points and ships them as size-bounded requests.
pub struct ScalarBatcher {
    service: Arc<dyn WriteService>,
    limiter: Arc<Mutex<RateLimiter>>,
    retry: RetryStrategy,
    session_id: String,
    max_request_bytes: usize,
    request: WriteBatchRequest,
    /// Bytes still spendable in the in-progress request.
    remaining: usize,
    run_index: HashMap<String, usize>,
    tag_index: HashMap<(String, String), usize>,
    /// First-seen metadata per (run, tag), kept across flushes. Later
    /// conflicting metadata is ignored with a warning.
    tag_metadata: HashMap<(String, String), Option<String>>,
}

impl ScalarBatcher {
    pub fn new(
        service: Arc<dyn WriteService>,
        limiter: Arc<Mutex<RateLimiter>>,
        retry: RetryStrategy,
        session_id: String,
        max_request_bytes: usize,
    ) -> Result<Self, MirrorError> {
        let mut batcher = Self {
            service,
            limiter,
            retry,
            session_id,
            max_request_bytes,
            request: WriteBatchRequest::default(),
            remaining: 0,
            run_index: HashMap::new(),
            tag_index: HashMap::new(),
            tag_metadata: HashMap::new(),
        };
        batcher.reset()?;
        Ok(batcher)
    }

    fn reset(&mut self) -> Result<(), MirrorError> {
        self.request = WriteBatchRequest {
            session_id: self.session_id.clone(),
            runs: Vec::new(),
        };
        self.run_index.clear();
        self.tag_index.clear();
        let envelope = encoded_len(&self.request)?;
        self.remaining = self.max_request_bytes.saturating_sub(envelope);
        Ok(())
    }

    /// Buffers one point, flushing first when it does not fit next to what is
    /// already buffered. A point too large for even an empty request is a
    /// fatal [`MirrorError::PointTooLarge`].
    pub async fn add_point(
        &mut self,
        run: &str,
        tag: &str,
        metadata: Option<&str>,
        point: ScalarPoint,
    ) -> Result<(), MirrorError> {
        self.memorize_metadata(run, tag, metadata);
        match self.try_add(run, tag, &point)? {
            AddOutcome::Added => Ok(()),
            AddOutcome::NeedsFlush => {
                self.flush().await?;
                match self.try_add(run, tag, &point)? {
                    AddOutcome::Added => Ok(()),
                    AddOutcome::NeedsFlush => Err(MirrorError::PointTooLarge {
                        size: self.point_cost(run, tag, &point)?,
                        budget: self.remaining,
                    }),
                }
            }
        }
    }

    fn memorize_metadata(&mut self, run: &str, tag: &str, metadata: Option<&str>) {
        let key = (run.to_string(), tag.to_string());
        match self.tag_metadata.get(&key) {
            None => {
                self.tag_metadata
                    .insert(key, metadata.map(ToString::to_string));
            }
            Some(memorized) => {
                if metadata.is_some() && memorized.as_deref() != metadata {
                    warn!(
                        "conflicting metadata for tag {tag:?} in run {run:?}; \
                         keeping the first value seen"
                    );
                }
            }
        }
    }

    /// Full cost of the point, including any run and tag containers that
    /// would have to be opened for it.
    fn point_cost(&self, run: &str, tag: &str, point: &ScalarPoint) -> Result<usize, MirrorError> {
        let encoded = encoded_len(point)?;
        let mut cost = encoded + varint_len(encoded as u64) + 1;

        let tag_key = (run.to_string(), tag.to_string());
        if !self.tag_index.contains_key(&tag_key) {
            let tag_batch = TagBatch {
                name: tag.to_string(),
                metadata: self.tag_metadata.get(&tag_key).cloned().flatten(),
                points: Vec::new(),
            };
            cost += encoded_len(&tag_batch)? + MAX_VARINT_LENGTH_BYTES + 1;
        }
        if !self.run_index.contains_key(run) {
            let run_batch = RunBatch {
                name: run.to_string(),
                tags: Vec::new(),
            };
            cost += encoded_len(&run_batch)? + MAX_VARINT_LENGTH_BYTES + 1;
        }
        Ok(cost)
    }

    /// Costs the point against the remaining budget and buffers it when it
    /// fits. Never mutates the request on [`AddOutcome::NeedsFlush`].
    pub fn try_add(
        &mut self,
        run: &str,
        tag: &str,
        point: &ScalarPoint,
    ) -> Result<AddOutcome, MirrorError> {
        let cost = self.point_cost(run, tag, point)?;
        if cost > self.remaining {
            return Ok(AddOutcome::NeedsFlush);
        }
        self.remaining -= cost;

        let run_idx = match self.run_index.get(run) {
            Some(idx) => *idx,
            None => {
                self.request.runs.push(RunBatch {
                    name: run.to_string(),
                    tags: Vec::new(),
                });
                let idx = self.request.runs.len() - 1;
                self.run_index.insert(run.to_string(), idx);
                idx
            }
        };

        let tag_key = (run.to_string(), tag.to_string());
        let tag_idx = match self.tag_index.get(&tag_key) {
            Some(idx) => *idx,
            None => {
                let metadata = self.tag_metadata.get(&tag_key).cloned().flatten();
                self.request.runs[run_idx].tags.push(TagBatch {
                    name: tag.to_string(),
                    metadata,
                    points: Vec::new(),
                });
                let idx = self.request.runs[run_idx].tags.len() - 1;
                self.tag_index.insert(tag_key, idx);
                idx
            }
        };

        self.request.runs[run_idx].tags[tag_idx].points.push(point.clone());
        Ok(AddOutcome::Added)
    }

    /// Ships the in-progress request. An empty request is a no-op. Transient
    /// transport failure past the retry budget drops the batch with a
    /// warning; a missing session stops the upload.
    pub async fn flush(&mut self) -> Result<(), MirrorError> {
        let mut request = std::mem::take(&mut self.request);
        self.reset()?;

        request.runs.retain_mut(|run| {
            run.tags.retain(|tag| !tag.points.is_empty());
            !run.tags.is_empty()
        });
        if request.runs.is_empty() {
            return Ok(());
        }

        let bytes = encoded_len(&request)?;
        let started = Instant::now();
        self.limiter.lock().await.tick().await;

        let service = Arc::clone(&self.service);
        let result = call_with_retry(self.retry, || {
            let service = Arc::clone(&service);
            let request = request.clone();
            async move { service.write_batch(request).await }
        })
        .await;

        match result {
            Ok(()) => {
                info!(
                    "shipped scalar batch: {bytes} bytes in {:?}",
                    started.elapsed()
                );
                Ok(())
            }
            Err(RpcError::NotFound(_)) => {
                Err(MirrorError::SessionNotFound(self.session_id.clone()))
            }
            Err(err) => {
                warn!("dropping scalar batch of {bytes} bytes: {err}");
                Ok(())
            }
        }
    }
}
