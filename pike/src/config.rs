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

//! Server configuration
//!
//! Pike configuration files are YAML. Unknown keys are ignored so configs can carry
//! extra key-values for other tooling.

use clap::Parser;
use log::{debug, trace};
use pike_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use std::fs;

/// The configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PikeConf {
    /// The server name, announced in Server-Timing descriptions
    pub name: String,
    /// Bind address, e.g. `127.0.0.1:3015`. A bare `:port` binds all interfaces.
    pub listen: String,
    /// Path prefix delegated to the admin surface
    pub admin_prefix: String,
    /// Max simultaneous requests, 0 for unlimited. This is a soft limit: requests over
    /// it are rejected with 503 rather than queued.
    pub concurrency: usize,
    /// Max number of cached responses, 0 for unbounded
    pub cache_size: usize,
    /// Negative cache TTL in seconds for uncacheable fetch outcomes
    pub hit_for_pass: u32,
    /// Sweep cadence in seconds for expired cache entries
    pub expired_clear_interval: u64,
    /// Upstream connect timeout in seconds
    pub connect_timeout: u64,
    /// Deadline in seconds for reading a response, both from clients and upstreams
    pub read_timeout: u64,
    /// Deadline in seconds for writing a response to a client
    pub write_timeout: u64,
    /// Upper bound in seconds per keep-alive connection
    pub max_keepalive_duration: u64,
    /// Per-IP connection cap, 0 for unlimited
    pub max_conns_per_ip: usize,
    /// Reject request bodies above this many bytes
    pub max_request_body_size: usize,
    /// Upstream health probe cadence in seconds
    pub health_check_interval: u64,
    /// The director list in match priority order
    pub directors: Vec<DirectorConf>,
}

/// One director: a named route binding a match predicate to an upstream pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorConf {
    pub name: String,
    /// Hosts this director serves; empty matches any host
    pub hosts: Vec<String>,
    /// Path prefixes this director serves; empty matches any path
    pub prefixes: Vec<String>,
    /// Pass rules: regexes matched against `METHOD path?query`; a match bypasses the cache
    pub passes: Vec<String>,
    /// Backend base URLs, e.g. `http://127.0.0.1:5018`
    pub backends: Vec<String>,
}

impl Default for PikeConf {
    fn default() -> Self {
        PikeConf {
            name: "pike".to_string(),
            listen: ":3015".to_string(),
            admin_prefix: "/pike".to_string(),
            concurrency: 256 * 1024,
            cache_size: 1024,
            hit_for_pass: 300,
            expired_clear_interval: 300,
            connect_timeout: 5,
            read_timeout: 10,
            write_timeout: 10,
            max_keepalive_duration: 60,
            max_conns_per_ip: 0,
            max_request_body_size: 50 * 1024 * 1024,
            health_check_interval: 10,
            directors: vec![],
        }
    }
}

impl Default for DirectorConf {
    fn default() -> Self {
        DirectorConf {
            name: String::new(),
            hosts: vec![],
            prefixes: vec![],
            passes: vec![],
            backends: vec![],
        }
    }
}

/// Command-line options
///
/// Call `Opt::parse_args()` to build this object from the process's command line
/// arguments.
#[derive(Parser, Debug, Default)]
#[clap(name = "pike", long_about = None)]
pub struct Opt {
    /// The path to the configuration file.
    #[clap(short, long)]
    pub conf: Option<String>,

    /// Test the configuration and exit
    ///
    /// This flag is useful to make sure a new configuration can load before
    /// restarting the running server.
    #[clap(short, long)]
    pub test: bool,

    /// Override the listen address from the configuration file
    #[clap(short, long)]
    pub listen: Option<String>,
}

impl PikeConf {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            conf.validate()
        } else {
            let mut conf = PikeConf::default();
            conf.merge_with_opt(opt);
            conf.validate()
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: PikeConf = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");
        conf.validate()
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap()
    }

    pub fn validate(self) -> Result<Self> {
        if self.listen.is_empty() {
            return Error::e_explain(ReadError, "listen address must not be empty");
        }
        if !self.admin_prefix.starts_with('/') {
            return Error::e_explain(ReadError, "admin_prefix must start with /");
        }
        for director in &self.directors {
            if director.name.is_empty() {
                return Error::e_explain(ReadError, "director name must not be empty");
            }
            if director.backends.is_empty() {
                return Error::e_explain(
                    ReadError,
                    format!("director {} has no backends", director.name),
                );
            }
        }
        Ok(self)
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if let Some(listen) = &opt.listen {
            self.listen = listen.clone();
        }
    }

    /// The bind address: a bare `:port` binds all interfaces.
    pub fn bind_addr(&self) -> String {
        if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        }
    }
}

impl Opt {
    /// Create an instance of Opt by parsing the current command-line args.
    pub fn parse_args() -> Self {
        Opt::parse()
    }
}
