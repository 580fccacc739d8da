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

//! Request fingerprint
//!
//! A fingerprint identifies cache-equivalent requests. It combines a primary hash over
//! the canonicalized request target with an optional variance hash derived from the
//! request headers a backend declared via `Vary`.

use blake2::{Blake2b, Digest};
use http::Method;

// 16-byte / 128-bit key: large enough to avoid collision
const KEY_SIZE: usize = 16;

/// An 128 bit hash binary
pub type HashBinary = [u8; KEY_SIZE];

// hash output: we use a 128 bit (16 bytes) hash which maps to a 32 byte hex string.
// blake2 because the fingerprint must be stable across machines, unlike the
// in-memory-only hashes used for shard selection.
pub(crate) type Blake2b128 = Blake2b<blake2::digest::consts::U16>;

pub(crate) fn hex2str(hex: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(KEY_SIZE * 2);
    for c in hex {
        write!(s, "{:02x}", c).unwrap(); // safe, just dump hex to string
    }
    s
}

/// helper function: hash bytes to [HashBinary]
pub fn hash_key(key: &[u8]) -> HashBinary {
    let mut hasher = Blake2b128::new();
    hasher.update(key);
    hasher.finalize().into()
}

/// Whether this request method engages the cache at all
pub fn request_cacheable(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD)
}

/// The cache key of a request
///
/// Two requests with an equal fingerprint are cache-equivalent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    primary: HashBinary,
    variance: Option<HashBinary>,
}

impl Fingerprint {
    /// Build the [Fingerprint] for a request target.
    ///
    /// The method contributes to the hash so that GET and HEAD entries stay distinct.
    pub fn new(method: &Method, host: &str, path: &str, query: Option<&str>) -> Self {
        let mut hasher = Blake2b128::new();
        hasher.update(method.as_str());
        hasher.update([0u8]);
        hasher.update(host);
        hasher.update([0u8]);
        hasher.update(path);
        hasher.update([0u8]);
        if let Some(q) = query {
            hasher.update(q);
        }
        Fingerprint {
            primary: hasher.finalize().into(),
            variance: None,
        }
    }

    /// Set the value of the variance hash
    pub fn set_variance_key(&mut self, key: HashBinary) {
        self.variance = Some(key);
    }

    /// Get the value of the variance hash
    pub fn get_variance_key(&self) -> Option<&HashBinary> {
        self.variance.as_ref()
    }

    /// Removes the variance from this fingerprint
    pub fn remove_variance_key(&mut self) {
        self.variance = None;
    }

    /// Return the primary hash
    pub fn primary_bin(&self) -> HashBinary {
        self.primary
    }

    /// Return the hash including both primary and variance keys
    pub fn combined_bin(&self) -> HashBinary {
        if let Some(v) = self.variance.as_ref() {
            let mut hasher = Blake2b128::new();
            hasher.update(self.primary);
            hasher.update(v);
            hasher.finalize().into()
        } else {
            // if there is no variance, combined_bin is the same as primary_bin
            self.primary
        }
    }

    /// The hex string of [Self::combined_bin()], used to key the response store
    pub fn combined(&self) -> String {
        hex2str(&self.combined_bin())
    }

    /// The hex string of [Self::primary_bin()]
    pub fn primary(&self) -> String {
        hex2str(&self.primary)
    }
}
