// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Process-wide request instrumentation
//!
//! The stats handle is dependency-injected at server start instead of living in a
//! module-level global. Entering a request acquires a scoped guard so the concurrency
//! gauge is decremented on every exit path, including panics.

use pike_cache::RequestStatus;
use serde::Serialize;
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct Stats {
    concurrency: AtomicIsize,
    total: AtomicU64,
    pass: AtomicU64,
    fetching: AtomicU64,
    hit_for_pass: AtomicU64,
    cacheable: AtomicU64,
}

/// A read-only snapshot for the admin surface.
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub concurrency: isize,
    pub total: u64,
    pub pass: u64,
    pub fetching: u64,
    pub hit_for_pass: u64,
    pub cacheable: u64,
}

impl Stats {
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Stats::default())
    }

    /// Enter a request: bumps the totals and returns the guard that holds the
    /// concurrency slot until dropped.
    pub fn enter(self: &Arc<Self>) -> ConcurrencyGuard {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.concurrency.fetch_add(1, Ordering::Relaxed);
        ConcurrencyGuard {
            stats: self.clone(),
        }
    }

    /// The current number of in-flight requests.
    pub fn concurrency(&self) -> isize {
        self.concurrency.load(Ordering::Relaxed)
    }

    /// Tally which status served a request.
    pub fn count_status(&self, status: RequestStatus) {
        let counter = match status {
            RequestStatus::Pass => &self.pass,
            RequestStatus::Fetching => &self.fetching,
            RequestStatus::HitForPass => &self.hit_for_pass,
            RequestStatus::Cacheable => &self.cacheable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            concurrency: self.concurrency.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
            pass: self.pass.load(Ordering::Relaxed),
            fetching: self.fetching.load(Ordering::Relaxed),
            hit_for_pass: self.hit_for_pass.load(Ordering::Relaxed),
            cacheable: self.cacheable.load(Ordering::Relaxed),
        }
    }
}

/// Holds one concurrency slot; dropping it releases the slot.
pub struct ConcurrencyGuard {
    stats: Arc<Stats>,
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        self.stats.concurrency.fetch_sub(1, Ordering::Relaxed);
    }
}
