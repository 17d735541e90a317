// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Continuously mirrors a growing set of locally written, append-only log
//! directories into a remote write service.
//!
//! A long-running producer writes framed, timestamped records into rotating
//! files under a log root. This crate tails those files, discovers new runs
//! (subdirectories) as they appear, batches scalar records into size-bounded
//! write requests and streams large binary blobs in chunks, pacing every
//! outbound call through a shared rate limiter. Delivery is at-least-once:
//! producer crashes, partial writes, file rotation and transient network
//! failure are tolerated without losing or duplicating already-shipped data.
//!
//! The filesystem and the remote write service are capability objects
//! ([`fs::LogFs`] and [`rpc::WriteService`]); everything in between is owned
//! by this crate and driven by [`uploader::LogDirMirror`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batcher;
pub mod blobs;
pub mod config;
pub mod crawler;
pub mod error;
pub mod fs;
pub mod rate_limiter;
pub mod reader;
pub mod record;
pub mod rpc;
pub mod tracker;
pub mod uploader;

pub use config::MirrorConfig;
pub use error::MirrorError;
pub use uploader::LogDirMirror;
