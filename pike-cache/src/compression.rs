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

//! The in-place compression policy for cached bodies
//!
//! Cacheable bodies are compressed once at insertion time. Dispatch either emits the
//! stored gzip bytes as-is or inflates them for clients that do not accept gzip.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use http::header::{HeaderMap, ACCEPT_ENCODING, CONTENT_TYPE};
use pike_error::{ErrorType, OrErr, Result};
use std::io::{Read, Write};

/// Bodies below this length are stored raw, the gzip overhead is not worth it
pub const COMPRESS_MIN_LENGTH: usize = 1024;

const GZIP_LEVEL: u32 = 6;

/// How a cached body is encoded at rest. Fixed at insertion and never recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    Raw = 0,
    Gzip = 1,
}

impl Compression {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Compression::Raw),
            1 => Some(Compression::Gzip),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Raw => "raw",
            Compression::Gzip => "gzip",
        }
    }
}

// the content types worth compressing: text and the text-like application types
const COMPRESSIBLE_TYPES: &[&str] = &[
    "application/json",
    "application/javascript",
    "application/xml",
    "image/svg+xml",
];

/// Whether a response content type benefits from gzip
pub fn is_compressible(content_type: &str) -> bool {
    // strip parameters such as "; charset=utf-8"
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim();
    essence.starts_with("text/") || COMPRESSIBLE_TYPES.contains(&essence)
}

/// The store-time policy: gzip only compressible content types of a worthwhile size
pub fn should_compress(resp_headers: &HeaderMap, body_len: usize) -> bool {
    if body_len < COMPRESS_MIN_LENGTH {
        return false;
    }
    resp_headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(is_compressible)
        .unwrap_or(false)
}

/// Whether the client declared gzip support via `Accept-Encoding`
pub fn accepts_gzip(req_headers: &HeaderMap) -> bool {
    req_headers.get_all(ACCEPT_ENCODING).iter().any(|v| {
        v.to_str()
            .map(|s| {
                s.split(',').any(|enc| {
                    // ignore any quality parameter, "gzip;q=0" is rare enough to not matter
                    let enc = enc.split(';').next().unwrap_or(enc).trim();
                    enc.eq_ignore_ascii_case("gzip") || enc == "*"
                })
            })
            .unwrap_or(false)
    })
}

/// Gzip the data, infallible for any input
pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(data.len() / 2),
        flate2::Compression::new(GZIP_LEVEL),
    );
    encoder
        .write_all(data)
        .or_err(ErrorType::InternalError, "fail to gzip")?;
    encoder
        .finish()
        .or_err(ErrorType::InternalError, "fail to finish gzip")
}

/// Inflate gzip data
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .or_err(ErrorType::InternalError, "fail to gunzip")?;
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_gzip_round_trip() {
        let data = b"Hello Pike! ".repeat(200);
        let compressed = gzip(&data).unwrap();
        // gzip magic header
        assert_eq!(&compressed[..3], &[0x1f, 0x8b, 0x08]);
        assert!(compressed.len() < data.len());
        assert_eq!(gunzip(&compressed).unwrap(), data);
    }

    #[test]
    fn test_is_compressible() {
        assert!(is_compressible("text/html"));
        assert!(is_compressible("text/html; charset=utf-8"));
        assert!(is_compressible("application/json"));
        assert!(is_compressible("image/svg+xml"));
        assert!(!is_compressible("image/png"));
        assert!(!is_compressible("application/octet-stream"));
    }

    #[test]
    fn test_should_compress() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "text/html".parse().unwrap());
        assert!(should_compress(&headers, COMPRESS_MIN_LENGTH));
        // too small
        assert!(!should_compress(&headers, COMPRESS_MIN_LENGTH - 1));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "image/png".parse().unwrap());
        assert!(!should_compress(&headers, 4096));

        // no content type at all
        assert!(!should_compress(&HeaderMap::new(), 4096));
    }

    #[test]
    fn test_accepts_gzip() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, "gzip, deflate, br".parse().unwrap());
        assert!(accepts_gzip(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, "identity".parse().unwrap());
        assert!(!accepts_gzip(&headers));

        assert!(!accepts_gzip(&HeaderMap::new()));
    }
}
