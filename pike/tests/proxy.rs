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

//! End-to-end proxy scenarios against an in-process mock origin

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use pike::{DirectorConf, PikeConf, PikeServer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type OriginHandler =
    dyn Fn(&http::request::Parts) -> Response<Full<Bytes>> + Send + Sync + 'static;

/// A hyper origin on an ephemeral port that counts how often it is hit.
async fn spawn_origin<F>(delay: Duration, handler: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(&http::request::Parts) -> Response<Full<Bytes>> + Send + Sync + 'static,
{
    let handler: Arc<OriginHandler> = Arc::new(handler);
    let hits = Arc::new(AtomicUsize::new(0));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let origin_hits = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let handler = handler.clone();
            let hits = origin_hits.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        let (parts, _body) = req.into_parts();
                        Ok::<_, std::convert::Infallible>(handler(&parts))
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    (addr, hits)
}

/// A pike server routing everything to the origin, served on an ephemeral port.
async fn spawn_pike(origin: SocketAddr, passes: Vec<String>) -> SocketAddr {
    let mut conf = PikeConf::default();
    conf.hit_for_pass = 300;
    conf.directors = vec![DirectorConf {
        name: "test".to_string(),
        hosts: vec![],
        prefixes: vec![],
        passes,
        backends: vec![format!("http://{origin}")],
    }];
    let server = PikeServer::new(conf).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));
    // give the accept loop a beat to start
    tokio::time::sleep(Duration::from_millis(20)).await;
    addr
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

fn text_response(status: StatusCode, cache_control: &str, body: &str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert("content-type", "text/plain".parse().unwrap());
    if !cache_control.is_empty() {
        resp.headers_mut()
            .insert("cache-control", cache_control.parse().unwrap());
    }
    resp
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ping() {
    let (origin, _) = spawn_origin(Duration::ZERO, |_| {
        text_response(StatusCode::OK, "", "origin")
    })
    .await;
    let pike = spawn_pike(origin, vec![]).await;

    let resp = client()
        .get(format!("http://{pike}/ping"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "pong");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_coalescing() {
    // the origin is slow so all concurrent clients pile onto one in-flight fetch
    let (origin, hits) = spawn_origin(Duration::from_millis(200), |_| {
        text_response(StatusCode::OK, "max-age=60", "X")
    })
    .await;
    let pike = spawn_pike(origin, vec![]).await;

    let mut handles = vec![];
    for _ in 0..100 {
        let url = format!("http://{pike}/a");
        handles.push(tokio::spawn(async move {
            let resp = client().get(&url).send().await.unwrap();
            let status = resp.status();
            let body = resp.text().await.unwrap();
            (status, body)
        }));
    }
    for handle in handles {
        let (status, body) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "X");
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1, "exactly one upstream fetch");

    // within the TTL the origin is not contacted again
    let resp = client()
        .get(format!("http://{pike}/a"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "X");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hit_for_pass_on_uncacheable_status() {
    let (origin, hits) = spawn_origin(Duration::ZERO, |_| {
        text_response(StatusCode::INTERNAL_SERVER_ERROR, "", "oops")
    })
    .await;
    let pike = spawn_pike(origin, vec![]).await;

    // the upstream status is relayed and the outcome remembered as hit-for-pass
    let resp = client()
        .get(format!("http://{pike}/b"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // hit-for-pass bypasses the cache and goes straight upstream
    let resp = client()
        .get(format!("http://{pike}/b"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pass_method_bypasses_registry() {
    let (origin, hits) = spawn_origin(Duration::ZERO, |parts| {
        text_response(
            StatusCode::OK,
            "max-age=60",
            &format!("{} reply", parts.method),
        )
    })
    .await;
    let pike = spawn_pike(origin, vec![]).await;

    let resp = client()
        .post(format!("http://{pike}/c"))
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "POST reply");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // the POST created no registry entry, a following GET is a fresh miss
    let resp = client()
        .get(format!("http://{pike}/c"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "GET reply");
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // which is then cached
    let resp = client()
        .get(format!("http://{pike}/c"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "GET reply");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pass_rule() {
    let (origin, hits) = spawn_origin(Duration::ZERO, |_| {
        text_response(StatusCode::OK, "max-age=60", "fresh")
    })
    .await;
    let pike = spawn_pike(origin, vec!["^GET /nocache".to_string()]).await;

    for _ in 0..3 {
        let resp = client()
            .get(format!("http://{pike}/nocache"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
    // every request went upstream despite the cacheable headers
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_compression_negotiation() {
    let body = "compress me please ".repeat(120); // ~2 KB
    let expected = body.clone();
    let (origin, hits) = spawn_origin(Duration::ZERO, move |_| {
        let mut resp = Response::new(Full::new(Bytes::from(body.clone())));
        resp.headers_mut()
            .insert("content-type", "text/html".parse().unwrap());
        resp.headers_mut()
            .insert("cache-control", "max-age=60".parse().unwrap());
        resp
    })
    .await;
    let pike = spawn_pike(origin, vec![]).await;

    // client A accepts gzip and receives the stored gzip representation
    let resp = client()
        .get(format!("http://{pike}/page"))
        .header("accept-encoding", "gzip")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-encoding").unwrap(),
        "gzip",
        "stored representation is gzip"
    );
    let compressed = resp.bytes().await.unwrap();
    assert!(compressed.len() < expected.len());
    // gzip magic bytes
    assert_eq!(&compressed[..2], &[0x1f, 0x8b]);

    // client B does not accept gzip and receives the identical plaintext
    let resp = client()
        .get(format!("http://{pike}/page"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("content-encoding").is_none());
    assert_eq!(resp.text().await.unwrap(), expected);

    // stored exactly once
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_conditional_request() {
    let (origin, hits) = spawn_origin(Duration::ZERO, |_| {
        let mut resp = text_response(StatusCode::OK, "max-age=60", "versioned body");
        resp.headers_mut().insert("etag", "\"v1\"".parse().unwrap());
        resp
    })
    .await;
    let pike = spawn_pike(origin, vec![]).await;

    // populate the cache
    let resp = client()
        .get(format!("http://{pike}/doc"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("etag").unwrap(), "\"v1\"");

    // matching validator: 304 with no body
    let resp = client()
        .get(format!("http://{pike}/doc"))
        .header("if-none-match", "\"v1\"")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(resp.bytes().await.unwrap().len(), 0);

    // no validator: full 200
    let resp = client()
        .get(format!("http://{pike}/doc"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "versioned body");

    // everything after the first request was served from cache
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_timing_emitted() {
    let (origin, _) = spawn_origin(Duration::ZERO, |_| {
        text_response(StatusCode::OK, "max-age=60", "timed")
    })
    .await;
    let pike = spawn_pike(origin, vec![]).await;

    let resp = client()
        .get(format!("http://{pike}/timing"))
        .send()
        .await
        .unwrap();
    let timing = resp
        .headers()
        .get("server-timing")
        .expect("server-timing present")
        .to_str()
        .unwrap()
        .to_string();
    assert!(timing.contains("fetch="), "timing: {timing}");

    // cache hit reports the lookup instead
    let resp = client()
        .get(format!("http://{pike}/timing"))
        .send()
        .await
        .unwrap();
    let timing = resp
        .headers()
        .get("server-timing")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(timing.contains("cache-lookup="), "timing: {timing}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_director() {
    let (origin, _) = spawn_origin(Duration::ZERO, |_| {
        text_response(StatusCode::OK, "", "origin")
    })
    .await;

    let mut conf = PikeConf::default();
    conf.directors = vec![DirectorConf {
        name: "narrow".to_string(),
        hosts: vec!["only.example.com".to_string()],
        prefixes: vec![],
        passes: vec![],
        backends: vec![format!("http://{origin}")],
    }];
    let server = PikeServer::new(conf).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let resp = client()
        .get(format!("http://{addr}/a"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body.get("message").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upstream_down() {
    // nothing listens here
    let origin: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let pike = spawn_pike(origin, vec![]).await;

    let resp = client()
        .get(format!("http://{pike}/a"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_admin_surface() {
    let (origin, _) = spawn_origin(Duration::ZERO, |_| {
        text_response(StatusCode::OK, "max-age=60", "ok")
    })
    .await;
    let pike = spawn_pike(origin, vec![]).await;

    // drive one request through so the stats move
    client()
        .get(format!("http://{pike}/a"))
        .send()
        .await
        .unwrap();

    let resp = client()
        .get(format!("http://{pike}/pike/stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let stats: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(stats["stats"]["total"], 1);
    assert_eq!(stats["stats"]["fetching"], 1);
    assert_eq!(stats["cached_responses"], 1);

    let resp = client()
        .get(format!("http://{pike}/pike/directors"))
        .send()
        .await
        .unwrap();
    let directors: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(directors[0]["name"], "test");
}
