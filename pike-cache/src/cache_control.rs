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

//! Functions and utilities to parse Cache-Control headers and derive freshness TTLs

use http::header::{HeaderMap, HeaderValue, CACHE_CONTROL, EXPIRES};
use httpdate::HttpDate;
use indexmap::IndexMap;
use log::warn;
use pike_error::OrErr;
use once_cell::sync::Lazy;
use pike_error::{Error, ErrorType, Result};
use regex::bytes::Regex;
use std::num::IntErrorKind;
use std::str;
use std::time::SystemTime;

/// The max delta-second per [RFC 9111](https://datatracker.ietf.org/doc/html/rfc9111#section-1.2.2)
// "If a cache receives a delta-seconds
// value greater than the greatest integer it can represent, or if any
// of its subsequent calculations overflows, the cache MUST consider the
// value to be either 2147483648 (2^31) or the greatest positive integer
// it can conveniently represent."
pub const DELTA_SECONDS_OVERFLOW_VALUE: u32 = 2147483648;

/// Cache control directive key type
pub type DirectiveKey = String;

/// Cache control directive value type
#[derive(Debug)]
pub struct DirectiveValue(pub Vec<u8>);

impl AsRef<[u8]> for DirectiveValue {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl DirectiveValue {
    /// A [DirectiveValue] without quotes (`"`).
    pub fn parse_as_bytes(&self) -> &[u8] {
        self.0
            .strip_prefix(&[b'"'])
            .and_then(|bytes| bytes.strip_suffix(&[b'"']))
            .unwrap_or(&self.0[..])
    }

    /// Parse the [DirectiveValue] as delta seconds
    ///
    /// `"`s are ignored. The value is capped to [DELTA_SECONDS_OVERFLOW_VALUE].
    pub fn parse_as_delta_seconds(&self) -> Result<u32> {
        let value_str = str::from_utf8(self.parse_as_bytes()).or_err(
            ErrorType::InvalidHTTPHeader,
            "could not parse value as utf8",
        )?;
        match value_str.parse::<u32>() {
            Ok(value) => Ok(value),
            Err(e) => {
                // delta-seconds expect to handle positive overflow gracefully
                if e.kind() == &IntErrorKind::PosOverflow {
                    Ok(DELTA_SECONDS_OVERFLOW_VALUE)
                } else {
                    Error::e_because(
                        ErrorType::InvalidHTTPHeader,
                        "could not parse value as u32",
                        e,
                    )
                }
            }
        }
    }
}

/// An ordered map to store cache control key value pairs.
pub type DirectiveMap = IndexMap<DirectiveKey, Option<DirectiveValue>>;

/// Parsed Cache-Control directives
#[derive(Debug)]
pub struct CacheControl {
    /// The parsed directives
    pub directives: DirectiveMap,
}

// Cache-Control   = 1#cache-directive
// cache-directive = token [ "=" ( token / quoted-string ) ]
//
// The parsing is more permissive than the RFC in a few ways:
// - Allows semicolons as delimiters (in addition to commas).
// - Allows octets outside of visible ASCII in tokens.
// - Doesn't require no-value for "boolean directives," such as must-revalidate.
// - Allows quoted-string format for numeric values.
static RE_CACHE_DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?-u)(?:^|(?:\s*[,;]\s*))([^\x00-\x20\(\)<>@,;:\\"/\[\]\?=\{\}\x7F]+)(?:=((?:[^\x00-\x20\(\)<>@,;:\\"/\[\]\?=\{\}\x7F]+|(?:"(?:[^"\\]|\\.)*"))))?"#).unwrap()
});

impl CacheControl {
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let mut directives = IndexMap::new();
        // iterate in header line insertion order
        for line in headers.get_all(CACHE_CONTROL) {
            for captures in RE_CACHE_DIRECTIVE.captures_iter(line.as_bytes()) {
                // directive values don't have to be utf-8, but keys are stored as
                // strings for case-insensitive matching
                let Some(key) = captures
                    .get(1)
                    .and_then(|cap| str::from_utf8(cap.as_bytes()).ok())
                    .map(|token| token.to_lowercase())
                else {
                    continue;
                };
                let value = captures
                    .get(2)
                    .map(|cap| DirectiveValue(cap.as_bytes().to_vec()));
                // first one wins in case of duplicate directives
                directives.entry(key).or_insert(value);
            }
        }
        if directives.is_empty() {
            None
        } else {
            Some(CacheControl { directives })
        }
    }

    /// Parse the `Cache-Control` headers of a response.
    ///
    /// `None` when the response carries no Cache-Control directives at all.
    pub fn from_resp_headers(headers: &HeaderMap) -> Option<Self> {
        Self::from_headers(headers)
    }

    fn has_key(&self, key: &str) -> bool {
        self.directives.contains_key(key)
    }

    /// Whether the given directive is set without regard to its value
    pub fn no_store(&self) -> bool {
        self.has_key("no-store")
    }

    pub fn no_cache(&self) -> bool {
        self.has_key("no-cache")
    }

    pub fn private(&self) -> bool {
        self.has_key("private")
    }

    fn get_delta_seconds(&self, key: &str) -> Option<u32> {
        let value = self.directives.get(key)?.as_ref()?;
        match value.parse_as_delta_seconds() {
            Ok(seconds) => Some(seconds),
            Err(e) => {
                warn!("Ignoring unparseable {key} directive: {e}");
                None
            }
        }
    }

    /// The `s-maxage` delta seconds, if present and parseable
    pub fn s_maxage(&self) -> Option<u32> {
        self.get_delta_seconds("s-maxage")
    }

    /// The `max-age` delta seconds, if present and parseable
    pub fn max_age(&self) -> Option<u32> {
        self.get_delta_seconds("max-age")
    }

    /// The freshness TTL granted by the directives alone: `s-maxage` wins over `max-age`
    pub fn fresh_sec(&self) -> Option<u32> {
        self.s_maxage().or_else(|| self.max_age())
    }

    /// Whether the directives forbid storing this response in a shared cache
    pub fn uncacheable(&self) -> bool {
        self.no_store() || self.no_cache() || self.private()
    }
}

/// Calculate the freshness TTL from the `Expires` header only
fn expires_header_ttl(headers: &HeaderMap, now: SystemTime) -> Option<u32> {
    // treat multiple Expires headers as invalid, and invalid dates as already expired
    fn parse_expires_value(expires_value: &HeaderValue) -> Option<SystemTime> {
        let expires = expires_value.to_str().ok()?;
        Some(SystemTime::from(
            expires
                .parse::<HttpDate>()
                .map_err(|e| warn!("Invalid HttpDate in Expires: {expires}, error: {e}"))
                .ok()?,
        ))
    }

    let mut expires_iter = headers.get_all(EXPIRES).iter();
    let expires_header = expires_iter.next()?;
    if expires_iter.next().is_some() {
        return None;
    }
    let expire_time = parse_expires_value(expires_header).unwrap_or(SystemTime::UNIX_EPOCH);
    match expire_time.duration_since(now) {
        Ok(d) => Some(d.as_secs().min(DELTA_SECONDS_OVERFLOW_VALUE as u64) as u32),
        // a date in the past means already stale
        Err(_) => Some(0),
    }
}

/// Derive the freshness TTL in seconds for a response.
///
/// Precedence: `s-maxage` over `max-age` over `Expires`. `private`, `no-store` and
/// `no-cache` force a TTL of 0, which means do not cache.
pub fn response_ttl(headers: &HeaderMap, now: SystemTime) -> u32 {
    let cache_control = CacheControl::from_resp_headers(headers);
    if let Some(cc) = cache_control.as_ref() {
        if cc.uncacheable() {
            return 0;
        }
        if let Some(ttl) = cc.fresh_sec() {
            return ttl;
        }
    }
    expires_header_ttl(headers, now).unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn resp_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, value.parse().unwrap());
        headers
    }

    #[test]
    fn test_simple_directives() {
        let cc = CacheControl::from_resp_headers(&resp_headers("public, max-age=10")).unwrap();
        assert!(!cc.uncacheable());
        assert_eq!(cc.max_age(), Some(10));
        assert_eq!(cc.s_maxage(), None);
        assert_eq!(cc.fresh_sec(), Some(10));
    }

    #[test]
    fn test_s_maxage_precedence() {
        let cc =
            CacheControl::from_resp_headers(&resp_headers("max-age=10, s-maxage=20")).unwrap();
        assert_eq!(cc.fresh_sec(), Some(20));
    }

    #[test]
    fn test_quoted_and_overflow_values() {
        let cc = CacheControl::from_resp_headers(&resp_headers("max-age=\"10\"")).unwrap();
        assert_eq!(cc.max_age(), Some(10));

        let cc =
            CacheControl::from_resp_headers(&resp_headers("max-age=99999999999999")).unwrap();
        assert_eq!(cc.max_age(), Some(DELTA_SECONDS_OVERFLOW_VALUE));
    }

    #[test]
    fn test_uncacheable_directives() {
        for value in ["no-store", "no-cache", "private", "no-store, max-age=60"] {
            assert_eq!(response_ttl(&resp_headers(value), SystemTime::now()), 0);
        }
    }

    #[test]
    fn test_response_ttl() {
        let now = SystemTime::now();
        assert_eq!(response_ttl(&resp_headers("max-age=60"), now), 60);
        assert_eq!(response_ttl(&resp_headers("public"), now), 0);
        assert_eq!(response_ttl(&HeaderMap::new(), now), 0);
    }

    #[test]
    fn test_expires() {
        let now = SystemTime::now();
        let mut headers = HeaderMap::new();
        let expires = HttpDate::from(now + Duration::from_secs(100));
        headers.insert(EXPIRES, expires.to_string().parse().unwrap());
        let ttl = response_ttl(&headers, now);
        // HttpDate has one second granularity
        assert!((99..=100).contains(&ttl), "ttl = {ttl}");

        // expired in the past
        let mut headers = HeaderMap::new();
        let expires = HttpDate::from(now - Duration::from_secs(100));
        headers.insert(EXPIRES, expires.to_string().parse().unwrap());
        assert_eq!(response_ttl(&headers, now), 0);

        // garbage date means already expired
        let mut headers = HeaderMap::new();
        headers.insert(EXPIRES, "not a date".parse().unwrap());
        assert_eq!(response_ttl(&headers, now), 0);

        // max-age wins over Expires
        let mut headers = HeaderMap::new();
        let expires = HttpDate::from(now + Duration::from_secs(100));
        headers.insert(EXPIRES, expires.to_string().parse().unwrap());
        headers.insert(CACHE_CONTROL, "max-age=10".parse().unwrap());
        assert_eq!(response_ttl(&headers, now), 10);
    }
}
