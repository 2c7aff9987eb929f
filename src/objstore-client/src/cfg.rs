// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Client configuration.

use std::time::{Duration, SystemTime};

use crate::retry::Retry;

/// Tuning knobs for the object store client.
///
/// The defaults are safe for production use; tests shrink the buffer sizes to
/// exercise framing boundaries and the backoffs to keep runtimes reasonable.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Minimum number of appended bytes to accumulate before the writer emits
    /// write frames. Larger values amortize per-frame overhead at the cost of
    /// client memory.
    pub flush_interval_bytes: usize,
    /// Maximum payload carried by a single write frame. Buffered bytes beyond
    /// this are split across multiple frames.
    pub max_write_chunk_bytes: usize,
    /// First reconnect backoff after a retriable stream failure.
    pub retry_initial_backoff: Duration,
    /// Backoff multiplier between consecutive reconnect attempts.
    pub retry_multiplier: u32,
    /// Upper bound on any single reconnect backoff.
    pub retry_clamp_backoff: Duration,
    /// Total time budget for recovering any one operation. `None` retries
    /// until the operation succeeds or fails permanently.
    pub retry_deadline: Option<Duration>,
}

impl ClientConfig {
    pub const DEFAULT_FLUSH_INTERVAL_BYTES: usize = 16 * 1024 * 1024;
    pub const DEFAULT_MAX_WRITE_CHUNK_BYTES: usize = 2 * 1024 * 1024;
    pub const DEFAULT_RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
    pub const DEFAULT_RETRY_MULTIPLIER: u32 = 2;
    pub const DEFAULT_RETRY_CLAMP_BACKOFF: Duration = Duration::from_secs(60);

    /// A [Retry] seeded for one recovery episode under this config.
    pub(crate) fn retry(&self) -> Retry {
        Retry {
            initial_backoff: self.retry_initial_backoff,
            multiplier: self.retry_multiplier,
            clamp_backoff: self.retry_clamp_backoff,
            seed: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map_or(0, |x| u64::from(x.subsec_nanos())),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            flush_interval_bytes: Self::DEFAULT_FLUSH_INTERVAL_BYTES,
            max_write_chunk_bytes: Self::DEFAULT_MAX_WRITE_CHUNK_BYTES,
            retry_initial_backoff: Self::DEFAULT_RETRY_INITIAL_BACKOFF,
            retry_multiplier: Self::DEFAULT_RETRY_MULTIPLIER,
            retry_clamp_backoff: Self::DEFAULT_RETRY_CLAMP_BACKOFF,
            retry_deadline: None,
        }
    }
}
