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

//! # Pike
//!
//! An HTTP caching reverse proxy. Pike terminates client requests, routes them to a
//! backend selected by a director, and interposes a content cache with single-flight
//! request coalescing: concurrent equivalent requests cost at most one upstream fetch,
//! and uncacheable outcomes are remembered with a hit-for-pass negative cache.

pub mod config;
pub mod director;
pub mod dispatch;
pub mod server;
pub mod stats;
pub mod upstream;

pub use config::{DirectorConf, Opt, PikeConf};
pub use director::{Director, DirectorList, DirectorSnapshot};
pub use server::PikeServer;
pub use stats::{Stats, StatsSnapshot};

pub use pike_error::{Error, ErrorType, Result};
