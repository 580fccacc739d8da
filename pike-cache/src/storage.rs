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

//! The keyed repository of cached responses
//!
//! Content and recency are tracked separately. The content map serves reads under the
//! shared lock by cloning the immutable [Arc] snapshot; only inserts and deletes take
//! its exclusive lock. Recency bookkeeping lives behind its own small lock so promoting
//! a key on a read never blocks other readers of the content.

use crate::key::Fingerprint;
use crate::CachedResponse;

use parking_lot::{Mutex, RwLock};
use pike_error::{Error, ErrorType, Result};
use pike_lru::LruCache;
use std::collections::HashMap;
use std::sync::Arc;

pub struct ResponseStore {
    // key -> response snapshot; writers are rare (one insert per upstream fetch)
    cached: RwLock<HashMap<String, Arc<CachedResponse>>>,
    // strict recency order and the capacity decision
    recency: Mutex<LruCache<()>>,
}

impl ResponseStore {
    /// Create a [ResponseStore] holding at most `max_entries` responses, 0 for unbounded.
    pub fn new(max_entries: usize) -> Self {
        ResponseStore {
            cached: RwLock::new(HashMap::new()),
            recency: Mutex::new(LruCache::new(max_entries)),
        }
    }

    /// Store the response under the fingerprint, updating recency.
    ///
    /// The least recently used entry is evicted when the store is over capacity.
    pub fn save(&self, fp: &Fingerprint, resp: CachedResponse) -> Result<()> {
        resp.check_serializable()?;
        let key = fp.combined();
        let evicted = self.recency.lock().add(&key, ());
        let mut cached = self.cached.write();
        if let Some((evicted_key, _)) = evicted {
            cached.remove(&evicted_key);
        }
        cached.insert(key, Arc::new(resp));
        Ok(())
    }

    /// An immutable snapshot of the response stored under the fingerprint.
    pub fn get(&self, fp: &Fingerprint) -> Result<Arc<CachedResponse>> {
        self.get_key(&fp.combined())
    }

    pub(crate) fn get_key(&self, key: &str) -> Result<Arc<CachedResponse>> {
        let found = self.cached.read().get(key).cloned();
        let resp = found.ok_or_else(|| Error::new(ErrorType::CacheMiss))?;
        // a hit promotes the key; losing the race against an eviction is harmless
        self.recency.lock().get(key);
        Ok(resp)
    }

    pub fn delete(&self, fp: &Fingerprint) {
        self.delete_key(&fp.combined());
    }

    pub(crate) fn delete_key(&self, key: &str) {
        self.cached.write().remove(key);
        self.recency.lock().remove(key);
    }

    /// The number of stored responses.
    pub fn len(&self) -> usize {
        self.cached.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.cached.write().clear();
        self.recency.lock().clear();
    }

    /// Visit a point-in-time snapshot of the stored responses.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Arc<CachedResponse>),
    {
        for (key, resp) in self.cached.read().iter() {
            f(key, resp);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compression::Compression;
    use http::Method;

    fn fp(path: &str) -> Fingerprint {
        Fingerprint::new(&Method::GET, "example.com", path, None)
    }

    fn resp(body: &[u8]) -> CachedResponse {
        CachedResponse {
            created_at: 1000,
            ttl: 60,
            status_code: 200,
            compression: Compression::Raw,
            header: b"content-type: text/plain\r\n".to_vec().into(),
            body: body.to_vec().into(),
        }
    }

    #[test]
    fn test_save_get_delete() {
        let store = ResponseStore::new(10);
        let key = fp("/a");
        assert!(store.get(&key).is_err());

        store.save(&key, resp(b"hello")).unwrap();
        let got = store.get(&key).unwrap();
        assert_eq!(&got.body[..], b"hello");
        assert_eq!(store.len(), 1);

        store.delete(&key);
        let err = store.get(&key).unwrap_err();
        assert_eq!(*err.etype(), ErrorType::CacheMiss);
    }

    #[test]
    fn test_lru_eviction() {
        let store = ResponseStore::new(2);
        let a = fp("/a");
        let b = fp("/b");
        let c = fp("/c");
        store.save(&a, resp(b"a")).unwrap();
        store.save(&b, resp(b"b")).unwrap();
        // touch a so that b is the oldest
        store.get(&a).unwrap();
        store.save(&c, resp(b"c")).unwrap();

        let err = store.get(&b).unwrap_err();
        assert_eq!(*err.etype(), ErrorType::CacheMiss);
        assert!(store.get(&a).is_ok());
        assert!(store.get(&c).is_ok());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_update_in_place() {
        let store = ResponseStore::new(2);
        let a = fp("/a");
        store.save(&a, resp(b"one")).unwrap();
        store.save(&a, resp(b"two")).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(&store.get(&a).unwrap().body[..], b"two");
    }

    #[test]
    fn test_snapshot_outlives_eviction() {
        let store = ResponseStore::new(1);
        let a = fp("/a");
        store.save(&a, resp(b"a")).unwrap();
        let snapshot = store.get(&a).unwrap();
        // evict /a
        store.save(&fp("/b"), resp(b"b")).unwrap();
        assert!(store.get(&a).is_err());
        // the reader's snapshot is unaffected
        assert_eq!(&snapshot.body[..], b"a");
    }

    #[test]
    fn test_concurrent_readers() {
        // readers only need the shared lock on the content map
        let store = Arc::new(ResponseStore::new(10));
        let a = fp("/a");
        store.save(&a, resp(b"shared")).unwrap();

        let _outer = store.cached.read();
        // a second reader is not blocked by the first
        let got = store.get_key(&a.combined()).unwrap();
        assert_eq!(&got.body[..], b"shared");
    }
}
