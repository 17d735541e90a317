// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::rpc::RpcError;

/// Errors surfaced by the mirroring pipeline.
///
/// Transient I/O and transport failures are handled (logged and retried or
/// healed on the next cycle) inside the pipeline and never reach this enum;
/// every variant here either stops the upload session or signals a
/// programming / configuration mistake.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("create_session must be called before uploading")]
    SessionNotStarted,

    #[error("Upload session {0} no longer exists on the server")]
    SessionNotFound(String),

    #[error("A single point of {size} bytes cannot fit in an empty request (budget {budget} bytes)")]
    PointTooLarge { size: usize, budget: usize },

    #[error("A blob transfer is already in flight (run {run:?}, tag {tag:?})")]
    BlobInFlight { run: String, tag: String },

    #[error("Failed to encode request: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote call failed: {0}")]
    Rpc(#[from] RpcError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = MirrorError::SessionNotFound("sess-1".to_string());
        assert_eq!(
            error.to_string(),
            "Upload session sess-1 no longer exists on the server"
        );
    }

    #[test]
    fn test_rpc_error_is_wrapped() {
        let error = MirrorError::from(RpcError::Transient("connection reset".to_string()));
        assert!(matches!(error, MirrorError::Rpc(_)));
        assert!(error.to_string().contains("connection reset"));
    }
}
