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

//! The Pike server: the accept loop and the request pipeline
//!
//! Per request: director match, pass-rule evaluation, fingerprint, registry lookup
//! (possibly awaiting a coalesced fetch), then fetch/publish or a store read, and
//! finally dispatch. Errors are recovered at this boundary into HTTP responses.

use crate::config::{DirectorConf, PikeConf};
use crate::director::{Director, DirectorList, DirectorSnapshot};
use crate::dispatch::{build_response, error_response, ServerTiming};
use crate::stats::{Stats, StatsSnapshot};
use crate::upstream::{spawn_health_check, Fetcher};

use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use log::{debug, info, warn};
use parking_lot::Mutex;
use pike_cache::compression::should_compress;
use pike_cache::key::request_cacheable;
use pike_cache::variance::vary_field_names;
use pike_cache::{
    cache_control, compression, now_sec, serialize_headers, CacheOptions, CachedResponse,
    Compression, Fingerprint, HttpCache, RequestStatus,
};
use pike_error::{Error, ErrorType, OkOrErr, OrErr, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// The assembled server: configuration, cache core, directors, fetcher and stats.
pub struct PikeServer {
    conf: PikeConf,
    cache: Arc<HttpCache>,
    directors: Arc<DirectorList>,
    fetcher: Fetcher,
    stats: Arc<Stats>,
    conns_per_ip: Mutex<HashMap<IpAddr, usize>>,
}

impl PikeServer {
    pub fn new(conf: PikeConf) -> Result<Arc<Self>> {
        let cache = Arc::new(HttpCache::new(CacheOptions {
            max_entries: conf.cache_size,
            hit_for_pass_ttl: conf.hit_for_pass,
            // waiters give a silent fetcher the full upstream deadline plus one second
            watchdog: Duration::from_secs(conf.read_timeout + 1),
        }));
        let directors = Arc::new(DirectorList::from_conf(&conf.directors)?);
        let fetcher = Fetcher::new(
            Duration::from_secs(conf.connect_timeout),
            Duration::from_secs(conf.read_timeout),
        )?;
        Ok(Arc::new(PikeServer {
            conf,
            cache,
            directors,
            fetcher,
            stats: Stats::new_arc(),
            conns_per_ip: Mutex::new(HashMap::new()),
        }))
    }

    /// The read-only instrumentation snapshot for the admin surface.
    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The active director list for the admin surface.
    pub fn get_directors(&self) -> Vec<DirectorSnapshot> {
        self.directors.snapshot()
    }

    /// Atomically replace the director set. In-flight requests finish on the old set.
    pub fn reload_directors(&self, confs: &[DirectorConf]) -> Result<()> {
        self.directors.reload(confs)?;
        info!("directors reloaded, {} active", confs.len());
        Ok(())
    }

    /// The cache facade, exposed for invalidation tooling.
    pub fn cache(&self) -> &Arc<HttpCache> {
        &self.cache
    }

    /// Bind the configured listener and serve forever.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = self.conf.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .or_err_with(ErrorType::BindError, || format!("fail to bind {addr}"))?;
        info!("pike listening on {addr}");
        self.serve(listener).await
    }

    /// Start the background tasks and serve connections from the listener.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> Result<()> {
        self.cache
            .spawn_sweeper(Duration::from_secs(self.conf.expired_clear_interval.max(1)));
        spawn_health_check(
            self.directors.clone(),
            Duration::from_secs(self.conf.health_check_interval.max(1)),
            Duration::from_secs(self.conf.connect_timeout.max(1)),
        );

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("fail to accept connection: {e}");
                    continue;
                }
            };
            let Some(conn_guard) = self.acquire_conn(peer.ip()) else {
                debug!("connection cap reached for {}", peer.ip());
                continue; // drop the connection on the floor
            };
            let server = self.clone();
            tokio::spawn(async move {
                let _conn_guard = conn_guard;
                server.serve_connection(stream, peer.ip()).await;
            });
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: tokio::net::TcpStream, ip: IpAddr) {
        let io = TokioIo::new(stream);
        let server = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let server = server.clone();
            async move {
                Ok::<_, std::convert::Infallible>(server.handle(req, ip).await)
            }
        });
        let conn = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(Duration::from_secs(self.conf.read_timeout))
            .serve_connection(io, service);
        let keepalive = Duration::from_secs(self.conf.max_keepalive_duration.max(1));
        match tokio::time::timeout(keepalive, conn).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("connection from {ip} ended: {e}"),
            Err(_) => debug!("connection from {ip} exceeded keep-alive bound"),
        }
    }

    fn acquire_conn(self: &Arc<Self>, ip: IpAddr) -> Option<ConnGuard> {
        if self.conf.max_conns_per_ip == 0 {
            return Some(ConnGuard { server: None, ip });
        }
        let mut conns = self.conns_per_ip.lock();
        let count = conns.entry(ip).or_insert(0);
        if *count >= self.conf.max_conns_per_ip {
            return None;
        }
        *count += 1;
        Some(ConnGuard {
            server: Some(self.clone()),
            ip,
        })
    }

    /// The top of the request pipeline. Never returns an error: every failure is
    /// translated into an HTTP response here.
    pub async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
        client_ip: IpAddr,
    ) -> Response<Full<Bytes>> {
        let path = req.uri().path();
        if path == "/ping" {
            return plain_response(StatusCode::OK, "pong");
        }
        if path.starts_with(&self.conf.admin_prefix) {
            let path = path.to_string();
            return self.admin_respond(&path);
        }

        if self.conf.concurrency > 0 && self.stats.concurrency() >= self.conf.concurrency as isize
        {
            let e = Error::explain(ErrorType::HTTPStatus(503), "server concurrency limit reached");
            return error_response(&e);
        }
        let _guard = self.stats.enter();

        // the total deadline: the request may not outlive both socket budgets
        let deadline = Duration::from_secs(self.conf.read_timeout + self.conf.write_timeout);
        let mut resp = match tokio::time::timeout(deadline, self.proxy(req, client_ip)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                warn!("request failed: {e}");
                error_response(&e)
            }
            Err(_) => error_response(&Error::explain(
                ErrorType::WriteTimedout,
                "request deadline exceeded",
            )),
        };
        if let Ok(name) = http::HeaderValue::from_str(&self.conf.name) {
            resp.headers_mut().insert(http::header::SERVER, name);
        }
        resp
    }

    async fn proxy(
        self: &Arc<Self>,
        req: Request<Incoming>,
        client_ip: IpAddr,
    ) -> Result<Response<Full<Bytes>>> {
        let mut timing = ServerTiming::new();
        let (parts, body) = req.into_parts();
        let method = parts.method;
        let req_headers = parts.headers;

        let host = host_of(&req_headers, &parts.uri);
        let path = parts.uri.path().to_string();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| path.clone());

        let director = self
            .directors
            .find(&host, &path)
            .or_err(ErrorType::NoDirector, "no director for request")?;

        let body = read_body(body, self.conf.max_request_body_size).await?;

        let pass_target = format!("{} {}", method, path_and_query);
        let is_pass = !request_cacheable(&method) || director.is_pass(&pass_target);

        if is_pass {
            self.stats.count_status(RequestStatus::Pass);
            let fetched = self
                .fetch_direct(&director, &method, &path_and_query, &req_headers, body, client_ip, &mut timing)
                .await?;
            return build_response(&method, &req_headers, &fetched, timing);
        }

        let query = parts.uri.query();
        let fp = self
            .cache
            .request_fingerprint(&method, &host, &path, query, &req_headers);

        let (mut status, mut waiter) = self.cache.get_request_status(&fp);
        let mut retried = false;
        loop {
            if let Some(w) = waiter.take() {
                // coalesced onto the in-flight fetch; the wait is this request's fetch time
                let start = Instant::now();
                status = w.wait(now_sec()).await;
                timing.record("fetch", start.elapsed(), "coalesced upstream fetch");
            }
            if !retried {
                self.stats.count_status(status);
            }

            match status {
                RequestStatus::Fetching => {
                    let data = self
                        .fetch_and_publish(&director, &fp, &method, &path_and_query, &req_headers, client_ip, &mut timing)
                        .await?;
                    return build_response(&method, &req_headers, &data, timing);
                }
                RequestStatus::HitForPass => {
                    // known uncacheable: fetch without touching the registry
                    let fetched = self
                        .fetch_direct(&director, &method, &path_and_query, &req_headers, body, client_ip, &mut timing)
                        .await?;
                    return build_response(&method, &req_headers, &fetched, timing);
                }
                RequestStatus::Cacheable => {
                    let start = Instant::now();
                    let lookup = self.cache.get_response(&fp);
                    timing.record("cache-lookup", start.elapsed(), "read response store");
                    match lookup {
                        Ok(data) => return build_response(&method, &req_headers, &data, timing),
                        Err(e) if *e.etype() == ErrorType::CacheMiss && !retried => {
                            // The entry expired between the status read and the store
                            // read. Re-enter the registry as a fetch so racers on the
                            // same fingerprint coalesce onto one retry; a second miss
                            // surfaces as an error.
                            debug!("cacheable status without stored response, refetching");
                            retried = true;
                            let (next, next_waiter) = self.cache.retry_request_status(&fp);
                            status = next;
                            waiter = next_waiter;
                        }
                        Err(e) => return Err(e),
                    }
                }
                RequestStatus::Pass => {
                    // the registry never stores Pass
                    return Error::err_in(ErrorType::InternalError);
                }
            }
        }
    }

    /// Fetch for the `Pass` and `HitForPass` paths: no registry publication, the
    /// response is dispatched but never stored.
    #[allow(clippy::too_many_arguments)]
    async fn fetch_direct(
        &self,
        director: &Arc<Director>,
        method: &Method,
        path_and_query: &str,
        req_headers: &HeaderMap,
        body: Bytes,
        client_ip: IpAddr,
        timing: &mut ServerTiming,
    ) -> Result<CachedResponse> {
        let start = Instant::now();
        let fetched = self
            .fetcher
            .fetch(&director.upstream, method, path_and_query, req_headers, body, client_ip)
            .await?;
        timing.record("fetch", start.elapsed(), "upstream fetch");
        let mut headers = fetched.headers;
        headers.remove(CONTENT_LENGTH);
        Ok(CachedResponse {
            created_at: now_sec(),
            ttl: 0,
            status_code: fetched.status.as_u16(),
            compression: Compression::Raw,
            header: serialize_headers(&headers),
            body: fetched.body,
        })
    }

    /// The elected fetcher's path: fetch, decide cacheability, compress, store, and
    /// publish the outcome so every waiter is served.
    ///
    /// The work runs in a spawned task: a fetcher client that disconnects does not
    /// cancel the fetch, so waiters still receive the published result.
    #[allow(clippy::too_many_arguments)]
    async fn fetch_and_publish(
        self: &Arc<Self>,
        director: &Arc<Director>,
        fp: &Fingerprint,
        method: &Method,
        path_and_query: &str,
        req_headers: &HeaderMap,
        client_ip: IpAddr,
        timing: &mut ServerTiming,
    ) -> Result<CachedResponse> {
        let server = self.clone();
        let upstream = director.upstream.clone();
        let fp = fp.clone();
        let method = method.clone();
        let path_and_query = path_and_query.to_string();
        let req_headers = req_headers.clone();

        let task = tokio::spawn(async move {
            let fetch_start = Instant::now();
            let fetched = match server
                .fetcher
                .fetch(&upstream, &method, &path_and_query, &req_headers, Bytes::new(), client_ip)
                .await
            {
                Ok(fetched) => fetched,
                Err(e) => {
                    // remember the failure so the key is not hammered while it lasts
                    server.cache.mark_hit_for_pass(&fp);
                    return Err(e);
                }
            };
            let fetch_time = fetch_start.elapsed();

            let mut ttl = cache_control::response_ttl(&fetched.headers, SystemTime::now());
            if vary_field_names(&fetched.headers).is_none() {
                // Vary: * can never be satisfied by a fingerprint
                ttl = 0;
            }

            let mut stored_headers = fetched.headers.clone();
            stored_headers.remove(CONTENT_LENGTH);

            let mut body = fetched.body;
            let mut compression = Compression::Raw;
            let mut compress_time = None;
            if ttl > 0 && should_compress(&fetched.headers, body.len()) {
                let start = Instant::now();
                match compression::gzip(&body) {
                    Ok(z) => {
                        body = z.into();
                        compression = Compression::Gzip;
                        compress_time = Some(start.elapsed());
                    }
                    // an uncompressed copy is still a valid cache entry
                    Err(e) => warn!("fail to gzip body: {e}"),
                }
            }

            let data = CachedResponse {
                created_at: now_sec(),
                ttl,
                status_code: fetched.status.as_u16(),
                compression,
                header: serialize_headers(&stored_headers),
                body,
            };

            if ttl > 0 {
                match server.cache.save_response(&fp, data.clone(), &fetched.headers) {
                    Ok(()) => server.cache.mark_cacheable(&fp, ttl),
                    Err(e) => {
                        // still serve the current requester, just don't promise a cache
                        warn!("fail to store response: {e}");
                        server.cache.mark_hit_for_pass(&fp);
                    }
                }
            } else {
                server.cache.mark_hit_for_pass(&fp);
            }
            Ok((data, fetch_time, compress_time))
        });

        let (data, fetch_time, compress_time) = task
            .await
            .or_err(ErrorType::InternalError, "fetch task failed")??;
        timing.record("fetch", fetch_time, "upstream fetch");
        if let Some(elapsed) = compress_time {
            timing.record("compress", elapsed, "gzip stored body");
        }
        Ok(data)
    }

    fn admin_respond(&self, path: &str) -> Response<Full<Bytes>> {
        let suffix = &path[self.conf.admin_prefix.len()..];
        let body = match suffix {
            "/stats" => serde_json::json!({
                "stats": self.get_stats(),
                "cached_responses": self.cache.response_count(),
                "tracked_fingerprints": self.cache.status_count(),
            })
            .to_string(),
            "/directors" => match serde_json::to_string(&self.get_directors()) {
                Ok(body) => body,
                Err(e) => {
                    return error_response(&Error::because(
                        ErrorType::InternalError,
                        "fail to serialize directors",
                        e,
                    ))
                }
            },
            _ => return plain_response(StatusCode::NOT_FOUND, "not found"),
        };
        let mut resp = Response::new(Full::new(Bytes::from(body)));
        resp.headers_mut().insert(
            CONTENT_TYPE,
            http::HeaderValue::from_static("application/json; charset=utf-8"),
        );
        resp.headers_mut()
            .insert(CACHE_CONTROL, http::HeaderValue::from_static("no-cache"));
        resp
    }
}

struct ConnGuard {
    // None when no per-IP cap is configured
    server: Option<Arc<PikeServer>>,
    ip: IpAddr,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if let Some(server) = self.server.as_ref() {
            let mut conns = server.conns_per_ip.lock();
            if let Some(count) = conns.get_mut(&self.ip) {
                *count -= 1;
                if *count == 0 {
                    conns.remove(&self.ip);
                }
            }
        }
    }
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *resp.status_mut() = status;
    resp
}

fn host_of(headers: &HeaderMap, uri: &http::Uri) -> String {
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.host());
    // the Host header may carry a port, the director match is on the name alone
    host.map(|h| h.split(':').next().unwrap_or(h).to_string())
        .unwrap_or_default()
}

async fn read_body(body: Incoming, limit: usize) -> Result<Bytes> {
    let limited = Limited::new(body, limit);
    match limited.collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(_) => Error::e_explain(
            ErrorType::HTTPStatus(413),
            "request body over the configured limit",
        ),
    }
}
