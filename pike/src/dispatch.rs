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

//! The dispatcher builds the final client response
//!
//! It applies freshness headers, strong validators and conditional-request handling,
//! negotiates the body encoding against `Accept-Encoding`, and emits `Server-Timing`.

use blake2::{Blake2b, Digest};
use bytes::Bytes;
use http::header::{
    HeaderMap, HeaderValue, ACCEPT_RANGES, AGE, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH,
    CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, TRANSFER_ENCODING,
};
use http::{Method, Response, StatusCode};
use http_body_util::Full;
use httpdate::parse_http_date;
use pike_cache::{compression, now_sec, CachedResponse, Compression};
use pike_error::{Error, OrErr, Result};
use std::time::{Duration, Instant};

const SERVER_TIMING: &str = "server-timing";

/// Collects per-stage timings for one request.
///
/// Rendered as `<id>=<ms>;<desc>` entries, comma-joined, with Pike's own entries before
/// any inherited upstream entries.
pub struct ServerTiming {
    started: Instant,
    entries: Vec<(&'static str, u128, &'static str)>,
}

impl ServerTiming {
    pub fn new() -> Self {
        ServerTiming {
            started: Instant::now(),
            entries: Vec::with_capacity(4),
        }
    }

    pub fn record(&mut self, id: &'static str, elapsed: Duration, desc: &'static str) {
        self.entries.push((id, elapsed.as_millis(), desc));
    }

    /// Time a closure and record it under the given metric.
    pub fn measure<T, F: FnOnce() -> T>(&mut self, id: &'static str, desc: &'static str, f: F) -> T {
        let start = Instant::now();
        let out = f();
        self.record(id, start.elapsed(), desc);
        out
    }

    /// Total time since this request entered Pike.
    pub fn total(&self) -> Duration {
        self.started.elapsed()
    }

    fn render(&self, upstream: Option<&str>) -> String {
        let mut parts: Vec<String> = self
            .entries
            .iter()
            .map(|(id, ms, desc)| format!("{id}={ms};{desc}"))
            .collect();
        if let Some(upstream) = upstream {
            if !upstream.is_empty() {
                parts.push(upstream.to_string());
            }
        }
        parts.join(",")
    }
}

impl Default for ServerTiming {
    fn default() -> Self {
        Self::new()
    }
}

// full-size blake2 is overkill for a validator, 16 bytes of hash is plenty
type Blake2b128 = Blake2b<blake2::digest::consts::U16>;

/// A strong validator derived from the stored body bytes.
pub fn strong_etag(body: &[u8]) -> String {
    let mut hasher = Blake2b128::new();
    hasher.update(body);
    let hash: [u8; 16] = hasher.finalize().into();
    format!("\"{}\"", hex::encode(hash))
}

// The opaque part of an entity-tag: surrounding whitespace and any `W/` weakness
// prefix dropped. Weak comparison treats `W/"x"` and `"x"` as equal.
fn opaque_tag(etag: &[u8]) -> &[u8] {
    let etag = etag.trim_ascii();
    etag.strip_prefix(b"W/").unwrap_or(etag)
}

// Split an `If-None-Match` list into entity-tag candidates. A comma inside a quoted
// tag is part of the tag, not a delimiter, so `"a,b", "c"` yields exactly two tags.
// Legacy unquoted tags simply split at every comma.
fn split_etag_list(header: &[u8]) -> Vec<&[u8]> {
    let mut tags = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, &b) in header.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_quotes => escaped = true,
            b'"' => in_quotes = !in_quotes,
            b',' if !in_quotes => {
                tags.push(&header[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    tags.push(&header[start..]);
    tags
}

/// Weak-compare a request's `If-None-Match` header against the response's ETag.
///
/// `*` matches any representation. The header may carry several candidates as a comma
/// separated list, quoted per the RFC or bare from legacy senders.
pub fn etag_matches(if_none_match: &[u8], target_etag: &[u8]) -> bool {
    if if_none_match.trim_ascii() == b"*" {
        return true;
    }
    let target = opaque_tag(target_etag);
    if target.is_empty() {
        return false;
    }
    split_etag_list(if_none_match)
        .into_iter()
        .any(|candidate| opaque_tag(candidate) == target)
}

/// Evaluate conditional request headers against the response validators.
///
/// Returns true if the request should receive 304 Not Modified.
pub fn not_modified(
    method: &Method,
    req_headers: &HeaderMap,
    resp_status: u16,
    resp_headers: &HeaderMap,
) -> bool {
    // 304 can only validate 200
    if resp_status != StatusCode::OK.as_u16() {
        return false;
    }

    // If-None-Match takes precedence; If-Modified-Since MUST be ignored when present
    if req_headers.contains_key(IF_NONE_MATCH) {
        if let Some(etag) = resp_headers.get(ETAG) {
            for inm in req_headers.get_all(IF_NONE_MATCH) {
                if etag_matches(inm.as_bytes(), etag.as_bytes()) {
                    return true;
                }
            }
        }
        return false;
    }

    // If-Modified-Since applies to GET/HEAD only
    if matches!(*method, Method::GET | Method::HEAD) {
        let if_modified_since = req_headers
            .get(IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_http_date(v).ok());
        let last_modified = resp_headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_http_date(v).ok());
        if let (Some(ims), Some(lm)) = (if_modified_since, last_modified) {
            if ims >= lm {
                return true;
            }
        }
    }
    false
}

// Convert the headers into a 304 Not Modified shape: drop the representation
// metadata that no longer describes a body.
fn strip_for_304(headers: &mut HeaderMap) {
    headers.remove(CONTENT_LENGTH);
    headers.remove(CONTENT_TYPE);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(CONTENT_ENCODING);
    headers.remove(ACCEPT_RANGES);
}

/// Build the outbound client response from a cached (or just-fetched) record.
pub fn build_response(
    method: &Method,
    req_headers: &HeaderMap,
    data: &CachedResponse,
    mut timing: ServerTiming,
) -> Result<Response<Full<Bytes>>> {
    let mut headers = data.header_map()?;

    headers.insert(AGE, HeaderValue::from(data.age(now_sec())));

    // negotiate the body encoding against the stored representation
    let mut body = data.body.clone();
    match data.compression {
        Compression::Gzip => {
            if compression::accepts_gzip(req_headers) {
                headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            } else {
                let start = Instant::now();
                body = compression::gunzip(&data.body)?.into();
                timing.record("compress", start.elapsed(), "gunzip stored body");
                headers.remove(CONTENT_ENCODING);
            }
        }
        Compression::Raw => {
            headers.remove(CONTENT_ENCODING);
        }
    }

    // a strong validator: the upstream's ETag wins, otherwise hash the stored body
    if !headers.contains_key(ETAG) {
        let etag = strong_etag(&data.body);
        headers.insert(
            ETAG,
            HeaderValue::from_str(&etag).or_err(
                pike_error::ErrorType::InvalidHTTPHeader,
                "generated etag is not a header value",
            )?,
        );
    }

    let status;
    if not_modified(method, req_headers, data.status_code, &headers) {
        status = StatusCode::NOT_MODIFIED;
        strip_for_304(&mut headers);
        body = Bytes::new();
    } else {
        status = StatusCode::from_u16(data.status_code).or_err(
            pike_error::ErrorType::UpstreamMalformed,
            "invalid upstream status code",
        )?;
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        headers.remove(TRANSFER_ENCODING);
        if *method == Method::HEAD {
            body = Bytes::new();
        }
    }

    // Pike's own timing entries come first, upstream entries are preserved after
    let upstream_timing = headers
        .remove(SERVER_TIMING)
        .and_then(|v| v.to_str().map(|s| s.to_string()).ok());
    let rendered = timing.render(upstream_timing.as_deref());
    if !rendered.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&rendered) {
            headers.insert(SERVER_TIMING, value);
        }
    }

    let mut resp = Response::new(Full::new(body));
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    Ok(resp)
}

/// Translate an error into the client-facing HTTP response.
///
/// Every error is recovered here; none terminates the worker.
pub fn error_response(e: &Error) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(e.etype().http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({ "message": e.to_string() }).to_string();
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    resp.headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    resp
}

#[cfg(test)]
mod test {
    use super::*;
    use pike_cache::serialize_headers;

    fn cached(
        status_code: u16,
        compression: Compression,
        headers: &HeaderMap,
        body: &[u8],
    ) -> CachedResponse {
        CachedResponse {
            created_at: now_sec() - 5,
            ttl: 60,
            status_code,
            compression,
            header: serialize_headers(headers),
            body: body.to_vec().into(),
        }
    }

    fn html_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "text/html".parse().unwrap());
        headers
    }

    #[test]
    fn test_plain_dispatch() {
        let data = cached(200, Compression::Raw, &html_headers(), b"hello");
        let resp =
            build_response(&Method::GET, &HeaderMap::new(), &data, ServerTiming::new()).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(CONTENT_LENGTH).unwrap(), "5");
        assert_eq!(resp.headers().get(AGE).unwrap(), "5");
        assert!(resp.headers().get(ETAG).is_some());
        assert!(resp.headers().get(CONTENT_ENCODING).is_none());
    }

    #[test]
    fn test_gzip_negotiation() {
        let raw = b"some payload worth compressing".repeat(50);
        let gzipped = compression::gzip(&raw).unwrap();
        let data = cached(200, Compression::Gzip, &html_headers(), &gzipped);

        // client accepts gzip: stored bytes emitted as-is
        let mut req = HeaderMap::new();
        req.insert(http::header::ACCEPT_ENCODING, "gzip".parse().unwrap());
        let resp = build_response(&Method::GET, &req, &data, ServerTiming::new()).unwrap();
        assert_eq!(resp.headers().get(CONTENT_ENCODING).unwrap(), "gzip");
        assert_eq!(
            resp.headers().get(CONTENT_LENGTH).unwrap(),
            &gzipped.len().to_string()
        );

        // client does not accept gzip: inflated on the fly
        let resp =
            build_response(&Method::GET, &HeaderMap::new(), &data, ServerTiming::new()).unwrap();
        assert!(resp.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(
            resp.headers().get(CONTENT_LENGTH).unwrap(),
            &raw.len().to_string()
        );
        // the decompression shows up in the timing header
        let timing = resp.headers().get(SERVER_TIMING).unwrap().to_str().unwrap();
        assert!(timing.contains("compress="), "timing: {timing}");
    }

    #[test]
    fn test_conditional_etag() {
        let mut headers = html_headers();
        headers.insert(ETAG, "\"v1\"".parse().unwrap());
        let data = cached(200, Compression::Raw, &headers, b"body");

        let mut req = HeaderMap::new();
        req.insert(IF_NONE_MATCH, "\"v1\"".parse().unwrap());
        let resp = build_response(&Method::GET, &req, &data, ServerTiming::new()).unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
        assert!(resp.headers().get(CONTENT_LENGTH).is_none());
        assert!(resp.headers().get(CONTENT_TYPE).is_none());
        assert_eq!(resp.headers().get(ETAG).unwrap(), "\"v1\"");

        let mut req = HeaderMap::new();
        req.insert(IF_NONE_MATCH, "\"v2\"".parse().unwrap());
        let resp = build_response(&Method::GET, &req, &data, ServerTiming::new()).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_conditional_if_modified_since() {
        let mut headers = html_headers();
        headers.insert(
            LAST_MODIFIED,
            "Fri, 26 Mar 2010 00:05:00 GMT".parse().unwrap(),
        );
        let data = cached(200, Compression::Raw, &headers, b"body");

        let mut req = HeaderMap::new();
        req.insert(
            IF_MODIFIED_SINCE,
            "Fri, 26 Mar 2010 00:05:00 GMT".parse().unwrap(),
        );
        let resp = build_response(&Method::GET, &req, &data, ServerTiming::new()).unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);

        let mut req = HeaderMap::new();
        req.insert(
            IF_MODIFIED_SINCE,
            "Fri, 26 Mar 2010 00:03:00 GMT".parse().unwrap(),
        );
        let resp = build_response(&Method::GET, &req, &data, ServerTiming::new()).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_head_suppresses_body() {
        let data = cached(200, Compression::Raw, &html_headers(), b"hello");
        let resp =
            build_response(&Method::HEAD, &HeaderMap::new(), &data, ServerTiming::new()).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        // Content-Length reflects the suppressed body
        assert_eq!(resp.headers().get(CONTENT_LENGTH).unwrap(), "5");
    }

    #[test]
    fn test_server_timing_order() {
        let mut headers = html_headers();
        headers.insert(SERVER_TIMING, "origin=7;backend work".parse().unwrap());
        let data = cached(200, Compression::Raw, &headers, b"x");

        let mut timing = ServerTiming::new();
        timing.record("fetch", Duration::from_millis(12), "upstream fetch");
        let resp = build_response(&Method::GET, &HeaderMap::new(), &data, timing).unwrap();
        let value = resp.headers().get(SERVER_TIMING).unwrap().to_str().unwrap();
        // ours first, upstream's preserved after
        assert_eq!(value, "fetch=12;upstream fetch,origin=7;backend work");
    }

    #[test]
    fn test_etag_matches() {
        let target = br#""xyzzy""#;
        assert!(etag_matches(b"*", target));
        assert!(etag_matches(br#""xyzzy""#, target));
        assert!(etag_matches(br#"W/"xyzzy""#, target));
        assert!(etag_matches(br#""xyzzy""#, br#"W/"xyzzy""#));
        assert!(etag_matches(br#"a, "xyzzy", "c3po""#, target));
        assert!(!etag_matches(br#""abc""#, target));
        assert!(!etag_matches(br#""r2d2xyzzy", zzzfoo"#, target));
        // legacy unquoted tags compare whole
        assert!(etag_matches(b"a, xyzzy", b"xyzzy"));
        assert!(!etag_matches(b"r2d2xyzzy", b"xyzzy"));
        // a comma inside a quoted tag is part of the tag
        assert!(etag_matches(br#""a,b", "xyzzy""#, target));
        assert!(!etag_matches(br#""a,xyzzy""#, target));
        assert!(etag_matches(br#""a,b""#, br#""a,b""#));
    }

    #[test]
    fn test_error_response() {
        let e = Error::explain(pike_error::ErrorType::NoDirector, "no route for host");
        let resp = error_response(&e);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "application/json; charset=utf-8"
        );

        let e = Error::new(pike_error::ErrorType::UpstreamTimeout);
        assert_eq!(error_response(&e).status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
