// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Exponential backoff with jitter for stream reconnects.

use std::cmp;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Configuration for [RetryStream].
#[derive(Debug, Clone)]
pub struct Retry {
    /// The nominal backoff before the first retry.
    pub initial_backoff: Duration,
    /// Multiplier applied to the nominal backoff after each retry.
    pub multiplier: u32,
    /// Upper bound on the nominal backoff.
    pub clamp_backoff: Duration,
    /// Seed for backoff jitter.
    pub seed: u64,
}

impl Retry {
    /// Convert into [RetryStream].
    pub fn into_retry_stream(self) -> RetryStream {
        let rng = SmallRng::seed_from_u64(self.seed);
        let next_sleep = self.initial_backoff;
        RetryStream {
            cfg: self,
            rng,
            start: Instant::now(),
            attempt: 0,
            next_sleep,
        }
    }
}

/// A series of exponentially backed-off sleeps, jittered to ±50% of nominal
/// so coordinated reconnect storms spread out.
#[derive(Debug)]
pub struct RetryStream {
    cfg: Retry,
    rng: SmallRng,
    start: Instant,
    attempt: usize,
    next_sleep: Duration,
}

impl RetryStream {
    /// How many times [RetryStream::sleep] has been called.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// The nominal backoff of the next call to [RetryStream::sleep].
    pub fn next_sleep(&self) -> Duration {
        self.next_sleep
    }

    /// Whether sleeping again would overrun `deadline`, measured from the
    /// creation of this stream. A `None` deadline never exhausts.
    pub fn budget_exhausted(&self, deadline: Option<Duration>) -> bool {
        deadline.map_or(false, |d| self.start.elapsed() + self.next_sleep >= d)
    }

    fn advance(&mut self) -> Duration {
        let jitter = self.rng.gen_range(0.5..1.5);
        let slept = self.next_sleep.mul_f64(jitter);
        self.attempt += 1;
        self.next_sleep = cmp::min(
            self.next_sleep * self.cfg.multiplier,
            self.cfg.clamp_backoff,
        );
        slept
    }

    /// Sleep the jittered backoff and advance to the next one.
    pub async fn sleep(mut self) -> Self {
        let slept = self.advance();
        tokio::time::sleep(slept).await;
        self
    }
}
