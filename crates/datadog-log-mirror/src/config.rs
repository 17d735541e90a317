// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::MirrorError;
use crate::rpc::RetryStrategy;
use std::env;
use std::time::Duration;

/// Default cap on one outbound structured request. The server rejects
/// anything above 4 MiB; we pad a lot because larger requests have shown
/// occasional deadline overruns on the write path.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 128 * 1024;

/// Default minimum spacing between outbound write calls.
pub const DEFAULT_MIN_RPC_INTERVAL_SECS: u64 = 5;

/// Default age of the last write after which a log file is considered
/// inactive.
pub const DEFAULT_INACTIVE_FILE_SECS: u64 = 4000;

/// Default size of one streamed blob chunk. 4e6 bytes leaves breathing room
/// within the transport's 4 MiB message limit.
pub const DEFAULT_BLOB_CHUNK_BYTES: usize = 4_000_000;

/// Default number of listing workers in the directory crawler pool.
pub const DEFAULT_CRAWL_WORKERS: usize = 8;

/// Configuration for the log-directory mirroring agent.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Maximum serialized size of one structured write request, in bytes.
    pub max_request_bytes: usize,
    /// Minimum wall-clock seconds between dispatched remote calls.
    pub min_rpc_interval_secs: u64,
    /// Age in seconds of the last write after which a file is inactive.
    pub inactive_file_secs: u64,
    /// Size of one streamed blob chunk, in bytes.
    pub blob_chunk_bytes: usize,
    /// Worker count for the recursive-listing crawl strategy.
    pub crawl_workers: usize,
    /// Retry strategy applied to unary remote calls.
    pub retry_strategy: RetryStrategy,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            min_rpc_interval_secs: DEFAULT_MIN_RPC_INTERVAL_SECS,
            inactive_file_secs: DEFAULT_INACTIVE_FILE_SECS,
            blob_chunk_bytes: DEFAULT_BLOB_CHUNK_BYTES,
            crawl_workers: DEFAULT_CRAWL_WORKERS,
            retry_strategy: RetryStrategy::default(),
        }
    }
}

impl MirrorConfig {
    /// Create configuration from environment variables, falling back to the
    /// defaults for anything unset. A variable that is set but unparsable is
    /// a configuration error, not a silent fallback.
    pub fn from_env() -> Result<Self, MirrorError> {
        let defaults = Self::default();
        let config = Self {
            max_request_bytes: parse_env("DD_LOG_MIRROR_MAX_REQUEST_BYTES")?
                .unwrap_or(defaults.max_request_bytes),
            min_rpc_interval_secs: parse_env("DD_LOG_MIRROR_MIN_RPC_INTERVAL_SECS")?
                .unwrap_or(defaults.min_rpc_interval_secs),
            inactive_file_secs: parse_env("DD_LOG_MIRROR_INACTIVE_FILE_SECS")?
                .unwrap_or(defaults.inactive_file_secs),
            blob_chunk_bytes: parse_env("DD_LOG_MIRROR_BLOB_CHUNK_BYTES")?
                .unwrap_or(defaults.blob_chunk_bytes),
            crawl_workers: parse_env("DD_LOG_MIRROR_CRAWL_WORKERS")?
                .unwrap_or(defaults.crawl_workers),
            retry_strategy: defaults.retry_strategy,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), MirrorError> {
        // The request envelope alone takes a few dozen bytes; anything this
        // small cannot carry a single point.
        if self.max_request_bytes < 1024 {
            return Err(MirrorError::InvalidConfig(
                "max request size must be at least 1024 bytes".to_string(),
            ));
        }

        if self.blob_chunk_bytes == 0 {
            return Err(MirrorError::InvalidConfig(
                "blob chunk size must be greater than 0".to_string(),
            ));
        }

        if self.crawl_workers == 0 {
            return Err(MirrorError::InvalidConfig(
                "crawl worker count must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Minimum spacing between dispatched remote calls.
    pub fn min_rpc_interval(&self) -> Duration {
        Duration::from_secs(self.min_rpc_interval_secs)
    }

    /// Recency window used to classify files and runs as active.
    pub fn inactive_window(&self) -> Duration {
        Duration::from_secs(self.inactive_file_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, MirrorError> {
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            MirrorError::InvalidConfig(format!("{key} has unparsable value {raw:?}"))
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MirrorConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_tiny_request_cap() {
        let config = MirrorConfig {
            max_request_bytes: 16,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_chunk_size() {
        let config = MirrorConfig {
            blob_chunk_bytes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_workers() {
        let config = MirrorConfig {
            crawl_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    // Single test for all env-var behavior; the environment is
    // process-global, so splitting this up would race under the parallel
    // test runner.
    #[test]
    fn test_from_env_rejects_unparsable_values() {
        env::set_var("DD_LOG_MIRROR_MAX_REQUEST_BYTES", "not-a-number");
        let result = MirrorConfig::from_env();
        env::remove_var("DD_LOG_MIRROR_MAX_REQUEST_BYTES");
        assert!(matches!(result, Err(MirrorError::InvalidConfig(_))));

        env::set_var("DD_LOG_MIRROR_CRAWL_WORKERS", "3");
        let config = MirrorConfig::from_env().unwrap();
        env::remove_var("DD_LOG_MIRROR_CRAWL_WORKERS");
        assert_eq!(config.crawl_workers, 3);
        assert_eq!(config.max_request_bytes, DEFAULT_MAX_REQUEST_BYTES);
    }

    #[test]
    fn test_intervals() {
        let config = MirrorConfig::default();
        assert_eq!(config.min_rpc_interval(), Duration::from_secs(5));
        assert_eq!(config.inactive_window(), Duration::from_secs(4000));
    }
}
