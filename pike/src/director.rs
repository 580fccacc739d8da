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

//! Directors: named routes binding a match predicate to an upstream pool
//!
//! The active list is replaced wholesale on reload; requests in flight keep working
//! against the list they started with.

use crate::config::DirectorConf;
use crate::upstream::{BackendSnapshot, Upstream};

use arc_swap::ArcSwap;
use pike_error::{ErrorType, OrErr, Result};
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;

/// A named backend route.
///
/// Directors differ only in their match predicate and upstream pool, so they are one
/// struct rather than a hierarchy.
pub struct Director {
    pub name: String,
    hosts: Vec<String>,
    prefixes: Vec<String>,
    passes: Vec<Regex>,
    pub upstream: Arc<Upstream>,
}

impl Director {
    pub fn from_conf(conf: &DirectorConf) -> Result<Self> {
        let passes = conf
            .passes
            .iter()
            .map(|p| {
                Regex::new(p).or_err_with(ErrorType::InternalError, || {
                    format!("invalid pass rule {p} in director {}", conf.name)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let upstream = Arc::new(Upstream::new(&conf.backends)?);
        Ok(Director {
            name: conf.name.clone(),
            hosts: conf.hosts.clone(),
            prefixes: conf.prefixes.clone(),
            passes,
            upstream,
        })
    }

    /// Whether this director serves the host and path.
    ///
    /// An empty host set matches any host; an empty prefix list matches any path.
    pub fn matches(&self, host: &str, path: &str) -> bool {
        let host_match = self.hosts.is_empty() || self.hosts.iter().any(|h| h == host);
        let path_match = self.prefixes.is_empty()
            || self.prefixes.iter().any(|p| path.starts_with(p.as_str()));
        host_match && path_match
    }

    /// Whether a pass rule forces this request around the cache.
    ///
    /// `target` is `METHOD path?query`, so rules can match on either.
    pub fn is_pass(&self, target: &str) -> bool {
        self.passes.iter().any(|re| re.is_match(target))
    }

    pub fn snapshot(&self) -> DirectorSnapshot {
        DirectorSnapshot {
            name: self.name.clone(),
            hosts: self.hosts.clone(),
            prefixes: self.prefixes.clone(),
            passes: self.passes.iter().map(|re| re.as_str().to_string()).collect(),
            backends: self.upstream.snapshot(),
        }
    }
}

/// The serializable view of a director for the admin surface.
#[derive(Debug, Serialize)]
pub struct DirectorSnapshot {
    pub name: String,
    pub hosts: Vec<String>,
    pub prefixes: Vec<String>,
    pub passes: Vec<String>,
    pub backends: Vec<BackendSnapshot>,
}

/// The active director set, shared read-only by all request tasks.
pub struct DirectorList {
    active: ArcSwap<Vec<Arc<Director>>>,
}

impl DirectorList {
    pub fn from_conf(confs: &[DirectorConf]) -> Result<Self> {
        Ok(DirectorList {
            active: ArcSwap::from_pointee(Self::build(confs)?),
        })
    }

    fn build(confs: &[DirectorConf]) -> Result<Vec<Arc<Director>>> {
        confs
            .iter()
            .map(|c| Director::from_conf(c).map(Arc::new))
            .collect()
    }

    /// Atomically replace the active list. In-flight requests finish on the old list.
    pub fn reload(&self, confs: &[DirectorConf]) -> Result<()> {
        let list = Self::build(confs)?;
        self.active.store(Arc::new(list));
        Ok(())
    }

    /// The current list snapshot.
    pub fn load(&self) -> Arc<Vec<Arc<Director>>> {
        self.active.load_full()
    }

    /// The first director matching `(host, path)` in insertion order.
    pub fn find(&self, host: &str, path: &str) -> Option<Arc<Director>> {
        self.active
            .load()
            .iter()
            .find(|d| d.matches(host, path))
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<DirectorSnapshot> {
        self.active.load().iter().map(|d| d.snapshot()).collect()
    }
}
