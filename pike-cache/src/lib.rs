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

//! The caching core of Pike
//!
//! This crate combines the pieces a caching proxy needs between accepting a request and
//! dispatching a response:
//! - [key::Fingerprint]: identifies cache-equivalent requests
//! - [registry::StatusRegistry]: per-fingerprint state machine with single-flight
//!   request coalescing and a negative hit-for-pass cache
//! - [storage::ResponseStore]: LRU-bounded repository of compressed responses
//! - [HttpCache]: the facade tying them together with TTL expiry

pub mod cache_control;
pub mod compression;
pub mod key;
pub mod registry;
pub mod storage;
pub mod variance;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use log::debug;
use pike_error::{Error, ErrorType, OkOrErr, OrErr, Result};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub use compression::Compression;
pub use key::Fingerprint;
pub use registry::{RequestStatus, StatusRegistry, StatusWaiter};
pub use storage::ResponseStore;
pub use variance::VariancePredictor;

/// Seconds since the unix epoch.
pub fn now_sec() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// created_at u64 + ttl u32 + status_code u16 + compression u8 + header_len u32 + body_len u32
const FIXED_HEADER_SIZE: usize = 8 + 4 + 2 + 1 + 4 + 4;

/// An immutable cached response record.
///
/// `created_at + ttl` determines the absolute expiry. A record with `ttl == 0` is never
/// stored. The compression is fixed at insertion time and never recomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    /// Seconds since epoch at the time of the successful upstream fetch
    pub created_at: u64,
    /// Seconds of freshness permitted
    pub ttl: u32,
    /// Upstream HTTP status
    pub status_code: u16,
    /// How the body bytes are encoded at rest
    pub compression: Compression,
    /// The serialized response header block, hop-by-hop headers removed
    pub header: Bytes,
    /// Opaque body bytes
    pub body: Bytes,
}

impl CachedResponse {
    /// The absolute expiry in seconds since epoch.
    pub fn expire_at(&self) -> u64 {
        self.created_at + self.ttl as u64
    }

    pub fn is_expired(&self, now_sec: u64) -> bool {
        now_sec > self.expire_at()
    }

    /// The age to report to clients.
    pub fn age(&self, now_sec: u64) -> u64 {
        now_sec.saturating_sub(self.created_at)
    }

    pub(crate) fn check_serializable(&self) -> Result<()> {
        if self.header.len() > u32::MAX as usize || self.body.len() > u32::MAX as usize {
            return Error::e_explain(ErrorType::CacheWriteFailure, "record too large");
        }
        Ok(())
    }

    /// Encode the record into the length-prefixed binary layout.
    ///
    /// The layout is bit-exact across producer and consumer: a fixed header of
    /// big-endian `created_at: u64`, `ttl: u32`, `status_code: u16`, `compression: u8`,
    /// `header_len: u32`, `body_len: u32`, followed by header bytes then body bytes.
    pub fn serialize(&self) -> Result<Bytes> {
        self.check_serializable()?;
        let mut buf =
            BytesMut::with_capacity(FIXED_HEADER_SIZE + self.header.len() + self.body.len());
        buf.put_u64(self.created_at);
        buf.put_u32(self.ttl);
        buf.put_u16(self.status_code);
        buf.put_u8(self.compression as u8);
        buf.put_u32(self.header.len() as u32);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.header);
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    /// Decode a record produced by [Self::serialize].
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < FIXED_HEADER_SIZE {
            return Error::e_explain(ErrorType::InternalError, "record truncated");
        }
        let mut buf = buf;
        let created_at = buf.get_u64();
        let ttl = buf.get_u32();
        let status_code = buf.get_u16();
        let compression = Compression::from_u8(buf.get_u8())
            .or_err(ErrorType::InternalError, "unknown compression flag")?;
        let header_len = buf.get_u32() as usize;
        let body_len = buf.get_u32() as usize;
        if buf.remaining() != header_len + body_len {
            return Error::e_explain(ErrorType::InternalError, "record length mismatch");
        }
        let header = buf.copy_to_bytes(header_len);
        let body = buf.copy_to_bytes(body_len);
        Ok(CachedResponse {
            created_at,
            ttl,
            status_code,
            compression,
            header,
            body,
        })
    }

    /// Parse the stored header block back into a [HeaderMap].
    pub fn header_map(&self) -> Result<HeaderMap> {
        parse_headers(&self.header)
    }
}

/// Serialize response headers as `name: value\r\n` lines in insertion order.
pub fn serialize_headers(headers: &HeaderMap) -> Bytes {
    let mut buf = BytesMut::new();
    for (name, value) in headers.iter() {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.freeze()
}

/// Parse a header block produced by [serialize_headers].
pub fn parse_headers(block: &[u8]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in block.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let colon = line
            .iter()
            .position(|b| *b == b':')
            .or_err(ErrorType::InvalidHTTPHeader, "header line without colon")?;
        let name = HeaderName::from_bytes(&line[..colon])
            .or_err(ErrorType::InvalidHTTPHeader, "invalid header name")?;
        let value_start = if line.get(colon + 1) == Some(&b' ') {
            colon + 2
        } else {
            colon + 1
        };
        let value = HeaderValue::from_bytes(&line[value_start..])
            .or_err(ErrorType::InvalidHTTPHeader, "invalid header value")?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Options for [HttpCache].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Max number of cached responses, 0 for unbounded
    pub max_entries: usize,
    /// Negative cache TTL in seconds for uncacheable outcomes
    pub hit_for_pass_ttl: u32,
    /// How long waiters trust a silent fetcher; should exceed the upstream total timeout
    pub watchdog: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            max_entries: 1024,
            hit_for_pass_ttl: 300,
            watchdog: Duration::from_secs(61),
        }
    }
}

/// The cache facade: status registry + response store + variance predictor.
///
/// Expiry is enforced both lazily on access and by the periodic sweeper; sweeping a
/// `Cacheable` registry entry also deletes the stored response.
pub struct HttpCache {
    registry: StatusRegistry,
    store: ResponseStore,
    variance: VariancePredictor,
}

impl HttpCache {
    pub fn new(options: CacheOptions) -> Self {
        HttpCache {
            registry: StatusRegistry::new(options.watchdog, options.hit_for_pass_ttl),
            store: ResponseStore::new(options.max_entries),
            variance: VariancePredictor::new(options.max_entries.max(64)),
        }
    }

    /// Build the fingerprint for a request, folding in any predicted variance.
    pub fn request_fingerprint(
        &self,
        method: &http::Method,
        host: &str,
        path: &str,
        query: Option<&str>,
        req_headers: &HeaderMap,
    ) -> Fingerprint {
        let mut fp = Fingerprint::new(method, host, path, query);
        self.variance.apply(&mut fp, req_headers);
        fp
    }

    /// Look up the caching status for the fingerprint, expiring stale state on the way.
    pub fn get_request_status(&self, fp: &Fingerprint) -> (RequestStatus, Option<StatusWaiter>) {
        let now = now_sec();
        if let Some(RequestStatus::Cacheable) = self.registry.evict_if_expired(fp, now) {
            self.store.delete(fp);
        }
        self.registry.get_request_status(fp, now)
    }

    /// Re-enter the registry after a `Cacheable` status turned out to have no stored
    /// response.
    ///
    /// The stale entry is dropped first, so exactly one retrier is elected to refetch
    /// and concurrent racers on the same fingerprint coalesce onto it as waiters.
    pub fn retry_request_status(&self, fp: &Fingerprint) -> (RequestStatus, Option<StatusWaiter>) {
        self.registry.invalidate_cacheable(fp);
        self.registry.get_request_status(fp, now_sec())
    }

    /// Publish a cacheable outcome. The response must already be saved.
    pub fn mark_cacheable(&self, fp: &Fingerprint, ttl: u32) {
        self.registry.mark_cacheable(fp, ttl, now_sec());
    }

    /// Publish an uncacheable outcome, engaging the negative cache.
    pub fn mark_hit_for_pass(&self, fp: &Fingerprint) {
        self.registry.mark_hit_for_pass(fp, now_sec());
    }

    /// Store a response and remember the variance its headers declare.
    pub fn save_response(
        &self,
        fp: &Fingerprint,
        resp: CachedResponse,
        resp_headers: &HeaderMap,
    ) -> Result<()> {
        self.variance.record(fp, resp_headers);
        self.store.save(fp, resp)
    }

    /// An immutable snapshot of the stored response, `CacheMiss` when absent or expired.
    pub fn get_response(&self, fp: &Fingerprint) -> Result<Arc<CachedResponse>> {
        let resp = self.store.get(fp)?;
        if resp.is_expired(now_sec()) {
            self.store.delete(fp);
            return Error::err(ErrorType::CacheMiss);
        }
        Ok(resp)
    }

    pub fn delete_response(&self, fp: &Fingerprint) {
        self.store.delete(fp);
    }

    /// Drop expired registry entries and their stored responses. Returns how many
    /// registry entries were removed.
    pub fn sweep_expired(&self) -> usize {
        let removed = self.registry.sweep_expired(now_sec());
        let count = removed.len();
        for (hash, status) in removed {
            if status == RequestStatus::Cacheable {
                self.store.delete_key(&key::hex2str(&hash));
            }
        }
        count
    }

    /// Spawn the background sweeper task.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let removed = cache.sweep_expired();
                if removed > 0 {
                    debug!("swept {removed} expired cache entries");
                }
            }
        })
    }

    /// The number of stored responses.
    pub fn response_count(&self) -> usize {
        self.store.len()
    }

    /// The number of tracked fingerprints.
    pub fn status_count(&self) -> usize {
        self.registry.len()
    }
}
