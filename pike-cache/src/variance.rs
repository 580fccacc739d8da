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

//! Variance keys and the `Vary` predictor
//!
//! A backend only declares its variance headers on the response, but the variance has to
//! be folded into the fingerprint before the lookup. The predictor remembers, per primary
//! key, which header names a backend declared on earlier responses so that later requests
//! hash the right header values into their combined fingerprint.

use crate::key::{Blake2b128, Fingerprint, HashBinary};

use blake2::Digest;
use http::header::{HeaderMap, VARY};
use parking_lot::RwLock;
use pike_lru::LruCache;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A builder for variance keys. Hashing is not sensitive to insertion order.
pub struct VarianceBuilder<'a> {
    values: BTreeMap<Cow<'a, str>, Cow<'a, [u8]>>,
}

impl<'a> VarianceBuilder<'a> {
    /// Create an empty variance key. Has no variance by default - add some variance using
    /// [`Self::add_value`].
    pub fn new() -> Self {
        VarianceBuilder {
            values: BTreeMap::new(),
        }
    }

    /// Add a byte string to the variance key.
    pub fn add_value(&mut self, name: &'a str, value: &'a (impl AsRef<[u8]> + ?Sized)) {
        self.values
            .insert(name.into(), Cow::Borrowed(value.as_ref()));
    }

    /// Check whether this variance key actually has variance, or just refers to the root asset
    pub fn has_variance(&self) -> bool {
        !self.values.is_empty()
    }

    /// Hash this variance key. Returns [`None`] if [`Self::has_variance`] is false.
    pub fn finalize(self) -> Option<HashBinary> {
        const SALT: &[u8; 1] = &[0u8; 1];
        if self.has_variance() {
            let mut hash = Blake2b128::new();
            for (name, value) in self.values.iter() {
                hash.update(name.as_bytes());
                hash.update(SALT);
                hash.update(value);
                hash.update(SALT);
            }
            Some(hash.finalize().into())
        } else {
            None
        }
    }
}

impl<'a> Default for VarianceBuilder<'a> {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the lowercased, sorted header names a response declares via `Vary`.
///
/// Returns `None` when the response holds `Vary: *`, which no fingerprint can satisfy.
pub fn vary_field_names(resp_headers: &HeaderMap) -> Option<Vec<String>> {
    let mut names = Vec::new();
    for value in resp_headers.get_all(VARY) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for name in value.split(',') {
            let name = name.trim();
            if name == "*" {
                return None;
            }
            if !name.is_empty() {
                names.push(name.to_ascii_lowercase());
            }
        }
    }
    names.sort();
    names.dedup();
    Some(names)
}

/// Remembers which header names each primary key varies on.
pub struct VariancePredictor {
    // primary key hex -> vary field names from the last stored response
    known: RwLock<LruCache<Arc<[String]>>>,
}

impl VariancePredictor {
    /// Create a [VariancePredictor] remembering at most `limit` primary keys.
    pub fn new(limit: usize) -> Self {
        VariancePredictor {
            known: RwLock::new(LruCache::new(limit)),
        }
    }

    /// Record the variance a response declared for its primary key.
    ///
    /// A response without `Vary` clears any previous prediction so stale variance does not
    /// fragment the keyspace forever.
    pub fn record(&self, fp: &Fingerprint, resp_headers: &HeaderMap) {
        let names = match vary_field_names(resp_headers) {
            Some(names) => names,
            // Vary: * is not cacheable, nothing worth remembering
            None => return,
        };
        let primary = fp.primary();
        let mut known = self.known.write();
        if names.is_empty() {
            known.remove(&primary);
        } else {
            known.add(&primary, names.into());
        }
    }

    /// Fold the predicted variance for this primary key into the fingerprint.
    ///
    /// Returns true if the fingerprint gained a variance key.
    pub fn apply(&self, fp: &mut Fingerprint, req_headers: &HeaderMap) -> bool {
        let names = {
            let mut known = self.known.write();
            match known.get(&fp.primary()) {
                Some(names) => names.clone(),
                None => return false,
            }
        };
        let mut variance = VarianceBuilder::new();
        for name in names.iter() {
            let value = req_headers
                .get(name.as_str())
                .map(|v| v.as_bytes())
                .unwrap_or(b"");
            variance.add_value(name, value);
        }
        match variance.finalize() {
            Some(key) => {
                fp.set_variance_key(key);
                true
            }
            None => false,
        }
    }
}
