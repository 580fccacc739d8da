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

//! The request-status registry
//!
//! For each fingerprint the registry tracks a single state and guarantees at most one
//! concurrent backend fetch. The first caller to look up an unknown fingerprint is
//! elected the fetcher; everyone arriving while the state is `Fetching` receives a
//! [StatusWaiter] and awaits the fetcher's publication.

use crate::key::{Fingerprint, HashBinary};

use log::warn;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::IntoStaticStr;
use tokio::sync::Semaphore;

const N_SHARDS: usize = 16;

/// The caching state of a request fingerprint.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoStaticStr)]
pub enum RequestStatus {
    /// A fetch for this fingerprint is in flight
    Fetching,
    /// The fingerprint was recently seen to be uncacheable, bypass the cache
    HitForPass,
    /// A fresh response is readable from the response store
    Cacheable,
    /// The request bypasses the registry entirely; never stored as an entry state
    Pass,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetching => "fetching",
            Self::HitForPass => "hit_for_pass",
            Self::Cacheable => "cacheable",
            Self::Pass => "pass",
        }
    }
}

impl From<RequestStatus> for u8 {
    fn from(s: RequestStatus) -> u8 {
        match s {
            RequestStatus::Fetching => 0,
            RequestStatus::HitForPass => 1,
            RequestStatus::Cacheable => 2,
            RequestStatus::Pass => 3,
        }
    }
}

impl From<u8> for RequestStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Fetching,
            1 => Self::HitForPass,
            2 => Self::Cacheable,
            3 => Self::Pass,
            _ => Self::HitForPass, // placeholder
        }
    }
}

struct EntryCore {
    fetch_start: Instant,
    watchdog: Duration,
    hit_for_pass_ttl: u32,
    // use u8 for Atomic enum
    status: AtomicU8,
    // absolute expiry in seconds since epoch, 0 while still fetching
    expire_at: AtomicU64,
    notify: Semaphore,
}

impl EntryCore {
    fn new_arc(watchdog: Duration, hit_for_pass_ttl: u32) -> Arc<Self> {
        Arc::new(EntryCore {
            fetch_start: Instant::now(),
            watchdog,
            hit_for_pass_ttl,
            status: AtomicU8::new(RequestStatus::Fetching.into()),
            expire_at: AtomicU64::new(0),
            notify: Semaphore::new(0),
        })
    }

    fn status(&self) -> RequestStatus {
        self.status.load(Ordering::SeqCst).into()
    }

    fn expired(&self, now_sec: u64) -> bool {
        let expire_at = self.expire_at.load(Ordering::SeqCst);
        expire_at != 0 && now_sec > expire_at
    }

    fn publish(&self, status: RequestStatus, expire_at: u64) {
        self.expire_at.store(expire_at, Ordering::SeqCst);
        self.status.store(status.into(), Ordering::SeqCst);
        // Any small positive number will do, the permits cascade as each woken
        // waiter returns its permit on drop.
        self.notify.add_permits(10);
    }

    // The watchdog fallback: flip a silent fetch to hit-for-pass so waiters never hang.
    // Only the first caller wins the race; publication is never done twice.
    fn publish_fallback(&self, now_sec: u64) {
        if self
            .status
            .compare_exchange(
                RequestStatus::Fetching.into(),
                RequestStatus::HitForPass.into(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.expire_at
                .store(now_sec + self.hit_for_pass_ttl as u64, Ordering::SeqCst);
            self.notify.add_permits(10);
        }
    }
}

struct EntryStub(Arc<EntryCore>);

impl EntryStub {
    fn waiter(&self) -> StatusWaiter {
        StatusWaiter(self.0.clone())
    }
}

type Shard = RwLock<HashMap<HashBinary, EntryStub>>;

// The fingerprint is already a uniform blake2 hash, so any of its bytes picks a
// shard fairly.
#[inline]
fn shard_index(key: &HashBinary) -> usize {
    key[0] as usize % N_SHARDS
}

/// The status entries, sharded by fingerprint to reduce lock contention.
struct ShardedEntries {
    shards: [Shard; N_SHARDS],
}

impl ShardedEntries {
    fn new() -> Self {
        ShardedEntries {
            shards: std::array::from_fn(|_| RwLock::new(HashMap::new())),
        }
    }

    fn shard(&self, key: &HashBinary) -> &Shard {
        &self.shards[shard_index(key)]
    }
}

/// The rendezvous a follower holds while the fetcher is working.
pub struct StatusWaiter(Arc<EntryCore>);

impl StatusWaiter {
    /// Wait until the fetcher publishes the outcome for this fingerprint.
    ///
    /// If nothing is published within the watchdog (measured from fetch start, so all
    /// waiters of one fetch share the same deadline), the waiter publishes `HitForPass`
    /// on the registry's behalf and wakes everyone else.
    pub async fn wait(&self, now_sec: u64) -> RequestStatus {
        if self.0.status() != RequestStatus::Fetching {
            return self.0.status();
        }
        let remaining = self
            .0
            .watchdog
            .saturating_sub(self.0.fetch_start.elapsed());
        match tokio::time::timeout(remaining, self.0.notify.acquire()).await {
            Ok(Ok(_permit)) => { // permit is returned to the Semaphore right away
            }
            Ok(Err(e)) => {
                warn!("error acquiring registry semaphore {e:?}")
            }
            Err(_) => {
                self.0.publish_fallback(now_sec);
            }
        }
        self.0.status()
    }
}

/// The per-fingerprint state table with single-flight coalescing.
pub struct StatusRegistry {
    entries: ShardedEntries,
    watchdog: Duration,
    hit_for_pass_ttl: u32,
}

impl StatusRegistry {
    /// Create a [StatusRegistry].
    ///
    /// `watchdog` bounds how long waiters trust a silent fetcher; it should exceed the
    /// upstream total timeout. `hit_for_pass_ttl` is the negative cache TTL in seconds.
    pub fn new(watchdog: Duration, hit_for_pass_ttl: u32) -> Self {
        StatusRegistry {
            entries: ShardedEntries::new(),
            watchdog,
            hit_for_pass_ttl,
        }
    }

    /// Look up the status for the fingerprint.
    ///
    /// - no entry: one is created in `Fetching` state and `(Fetching, None)` is
    ///   returned; the caller is elected the fetcher and must publish exactly once via
    ///   [Self::mark_cacheable] or [Self::mark_hit_for_pass].
    /// - `Fetching`: `(Fetching, Some(waiter))`; the caller must await the waiter.
    /// - `HitForPass` / `Cacheable`: `(status, None)`.
    pub fn get_request_status(
        &self,
        fp: &Fingerprint,
        now_sec: u64,
    ) -> (RequestStatus, Option<StatusWaiter>) {
        let key = fp.combined_bin();
        let shard = self.entries.shard(&key);
        if let Some(stub) = shard.read().get(&key) {
            match stub.0.status() {
                RequestStatus::Fetching => return (RequestStatus::Fetching, Some(stub.waiter())),
                status if !stub.0.expired(now_sec) => return (status, None),
                // expired, fall through to remove under the write lock
                _ => {}
            }
        }

        let mut shard = shard.write();
        // check again in case another request raced us here
        if let Some(stub) = shard.get(&key) {
            match stub.0.status() {
                RequestStatus::Fetching => return (RequestStatus::Fetching, Some(stub.waiter())),
                status if !stub.0.expired(now_sec) => return (status, None),
                _ => {
                    shard.remove(&key);
                }
            }
        }
        shard.insert(
            key,
            EntryStub(EntryCore::new_arc(self.watchdog, self.hit_for_pass_ttl)),
        );
        (RequestStatus::Fetching, None)
    }

    /// Remove the entry if it is published and expired, returning the expired status.
    ///
    /// The caller is responsible for deleting the corresponding stored response when the
    /// expired status was `Cacheable`.
    pub fn evict_if_expired(&self, fp: &Fingerprint, now_sec: u64) -> Option<RequestStatus> {
        let key = fp.combined_bin();
        let shard = self.entries.shard(&key);
        let expired = shard
            .read()
            .get(&key)
            .map(|stub| stub.0.expired(now_sec))
            .unwrap_or(false);
        if !expired {
            return None;
        }
        let mut shard = shard.write();
        // check again under the write lock
        if let Some(stub) = shard.get(&key) {
            if stub.0.expired(now_sec) {
                let status = stub.0.status();
                shard.remove(&key);
                return Some(status);
            }
        }
        None
    }

    /// Drop a `Cacheable` entry whose stored response turned out to be missing, so the
    /// next lookup elects a fresh fetcher.
    ///
    /// Only a `Cacheable` entry is removed: an entry a racing request already reset to
    /// `Fetching` keeps its in-flight fetch, and concurrent retriers coalesce onto it.
    pub fn invalidate_cacheable(&self, fp: &Fingerprint) {
        let key = fp.combined_bin();
        let mut shard = self.entries.shard(&key).write();
        if let Some(stub) = shard.get(&key) {
            if stub.0.status() == RequestStatus::Cacheable {
                shard.remove(&key);
            }
        }
    }

    fn publish(&self, fp: &Fingerprint, status: RequestStatus, ttl: u32, now_sec: u64) {
        let key = fp.combined_bin();
        let expire_at = now_sec + ttl as u64;
        let mut shard = self.entries.shard(&key).write();
        match shard.get(&key) {
            Some(stub) => stub.0.publish(status, expire_at),
            None => {
                // The entry can be gone if the watchdog fallback fired and a sweep ran
                // before a slow fetcher published. Reinstate so the outcome still counts.
                let core = EntryCore::new_arc(self.watchdog, self.hit_for_pass_ttl);
                core.publish(status, expire_at);
                shard.insert(key, EntryStub(core));
            }
        }
    }

    /// Transition the fingerprint to `Cacheable` for `ttl` seconds and wake all waiters.
    ///
    /// The corresponding response must already be readable from the response store.
    pub fn mark_cacheable(&self, fp: &Fingerprint, ttl: u32, now_sec: u64) {
        self.publish(fp, RequestStatus::Cacheable, ttl, now_sec);
    }

    /// Transition the fingerprint to `HitForPass` and wake all waiters.
    pub fn mark_hit_for_pass(&self, fp: &Fingerprint, now_sec: u64) {
        self.publish(
            fp,
            RequestStatus::HitForPass,
            self.hit_for_pass_ttl,
            now_sec,
        );
    }

    /// Drop every expired entry, returning `(fingerprint hash, status)` of each removal
    /// so the caller can delete the matching stored responses.
    pub fn sweep_expired(&self, now_sec: u64) -> Vec<(HashBinary, RequestStatus)> {
        let mut removed = Vec::new();
        for shard in &self.entries.shards {
            let expired: Vec<HashBinary> = shard
                .read()
                .iter()
                .filter(|(_, stub)| stub.0.expired(now_sec))
                .map(|(k, _)| *k)
                .collect();
            if expired.is_empty() {
                continue;
            }
            let mut shard = shard.write();
            for key in expired {
                if let Some(stub) = shard.get(&key) {
                    // the expiry is absolute, no need to re-check
                    let status = stub.0.status();
                    shard.remove(&key);
                    removed.push((key, status));
                }
            }
        }
        removed
    }

    /// The number of tracked fingerprints.
    pub fn len(&self) -> usize {
        self.entries
            .shards
            .iter()
            .map(|shard| shard.read().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
