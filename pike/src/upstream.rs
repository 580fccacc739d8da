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

//! Upstream pools and the backend fetcher
//!
//! An [Upstream] is a round-robin pool over currently-healthy peers. Health is flipped
//! by a periodic TCP probe task; request tasks only read the atomic flags.

use crate::director::DirectorList;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, ACCEPT_ENCODING, HOST};
use http::{Method, StatusCode};
use log::{debug, warn};
use pike_error::{Error, ErrorType, OkOrErr, OrErr, Result};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// headers that only belong to one hop, never forwarded in either direction
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// One backend origin.
pub struct Peer {
    url: String,
    healthy: AtomicBool,
}

impl Peer {
    fn new(url: &str) -> Result<Self> {
        if !url.starts_with("http://") {
            return Error::e_explain(
                ErrorType::InternalError,
                format!("backend url must be http:// : {url}"),
            );
        }
        Ok(Peer {
            url: url.trim_end_matches('/').to_string(),
            // assume healthy until the first probe says otherwise
            healthy: AtomicBool::new(true),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    // "http://host:port/..." -> "host:port" for the TCP probe
    fn probe_addr(&self) -> String {
        let rest = self.url.trim_start_matches("http://");
        let authority = rest.split('/').next().unwrap_or(rest);
        if authority.contains(':') {
            authority.to_string()
        } else {
            format!("{authority}:80")
        }
    }
}

/// The serializable view of one backend for the admin surface.
#[derive(Debug, Serialize)]
pub struct BackendSnapshot {
    pub url: String,
    pub healthy: bool,
}

/// A round-robin pool of backend origins.
pub struct Upstream {
    peers: Vec<Peer>,
    cursor: AtomicUsize,
}

impl Upstream {
    pub fn new(backends: &[String]) -> Result<Self> {
        if backends.is_empty() {
            return Error::e_explain(ErrorType::InternalError, "upstream needs backends");
        }
        let peers = backends
            .iter()
            .map(|url| Peer::new(url))
            .collect::<Result<Vec<_>>>()?;
        Ok(Upstream {
            peers,
            cursor: AtomicUsize::new(0),
        })
    }

    /// The next healthy peer in round-robin order, `None` when every peer is down.
    pub fn select(&self) -> Option<&Peer> {
        let len = self.peers.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..len {
            let peer = &self.peers[(start + i) % len];
            if peer.healthy() {
                return Some(peer);
            }
        }
        None
    }

    /// Probe every peer over TCP and update its health flag.
    pub async fn check_health(&self, timeout: Duration) {
        for peer in &self.peers {
            let addr = peer.probe_addr();
            let up = matches!(
                tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await,
                Ok(Ok(_))
            );
            if up != peer.healthy() {
                warn!("backend {} is now {}", peer.url, if up { "up" } else { "down" });
            }
            peer.set_healthy(up);
        }
    }

    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        self.peers
            .iter()
            .map(|p| BackendSnapshot {
                url: p.url.clone(),
                healthy: p.healthy(),
            })
            .collect()
    }
}

/// Spawn the background health probe over every director's upstream.
pub fn spawn_health_check(
    directors: Arc<DirectorList>,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let list = directors.load();
            for director in list.iter() {
                director.upstream.check_health(timeout).await;
            }
        }
    })
}

/// A fetched backend response, fully buffered, hop-by-hop headers removed.
#[derive(Debug)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Performs the backend HTTP round trip.
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .or_err(ErrorType::InternalError, "fail to build upstream client")?;
        Ok(Fetcher { client })
    }

    /// Round trip the request against a healthy peer of the upstream.
    pub async fn fetch(
        &self,
        upstream: &Upstream,
        method: &Method,
        path_and_query: &str,
        req_headers: &HeaderMap,
        body: Bytes,
        client_ip: IpAddr,
    ) -> Result<FetchedResponse> {
        let peer = upstream
            .select()
            .or_err(ErrorType::UpstreamUnreachable, "no healthy backend")?;
        let url = format!("{}{}", peer.url(), path_and_query);
        debug!("fetch {method} {url}");

        let mut headers = HeaderMap::with_capacity(req_headers.len() + 1);
        for (name, value) in req_headers.iter() {
            // Accept-Encoding stays out so origins answer with an identity body;
            // compression is Pike's own concern
            if is_hop_by_hop(name) || *name == ACCEPT_ENCODING || *name == HOST {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        if let Some(host) = req_headers.get(HOST) {
            if let Ok(value) = host.to_str() {
                if let Ok(value) = value.parse() {
                    headers.insert("x-forwarded-host", value);
                }
            }
        }
        let forwarded = match req_headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {client_ip}"),
            None => client_ip.to_string(),
        };
        if let Ok(value) = forwarded.parse() {
            headers.insert("x-forwarded-for", value);
        }

        let resp = self
            .client
            .request(method.clone(), &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| map_fetch_err(e, "fail to send upstream request"))?;

        let status = resp.status();
        let mut resp_headers = resp.headers().clone();
        for name in HOP_BY_HOP_HEADERS {
            resp_headers.remove(*name);
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| map_fetch_err(e, "fail to read upstream body"))?;

        Ok(FetchedResponse {
            status,
            headers: resp_headers,
            body,
        })
    }
}

fn map_fetch_err(e: reqwest::Error, context: &'static str) -> Box<Error> {
    let etype = if e.is_timeout() {
        ErrorType::UpstreamTimeout
    } else if e.is_connect() {
        ErrorType::UpstreamUnreachable
    } else if e.is_body() || e.is_decode() {
        ErrorType::UpstreamMalformed
    } else {
        ErrorType::UpstreamUnreachable
    };
    Error::because(etype, context, e).into_up()
}
