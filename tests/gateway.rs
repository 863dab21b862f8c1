//! End-to-end tests: a real upstream behind the gateway, driven over raw TCP

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use streamgate::admin::AdminServer;
use streamgate::config::{BackendConfig, PoolSettings};
use streamgate::parser::RouteParser;
use streamgate::pool::ProxyPool;
use streamgate::proxy::ProxyServer;
use streamgate::resolver::{Location, LocationResolver, StaticResolver};
use streamgate::source::Source;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Upstream that echoes what it received and sets its own CORS headers
async fn start_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-")
                            .to_string()
                    };
                    let body = format!(
                        "path={} xff={} rid={}",
                        req.uri(),
                        header("x-forwarded-for"),
                        header("x-request-id")
                    );
                    let response = Response::builder()
                        .header("Access-Control-Allow-Origin", "*")
                        .header("Access-Control-Allow-Credentials", "true")
                        .header("X-Upstream", "echo")
                        .body(Full::new(Bytes::from(body)))
                        .unwrap();
                    Ok::<_, Infallible>(response)
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

/// An address nothing listens on
async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

struct Gateway {
    addr: SocketAddr,
    pool: Arc<ProxyPool>,
    shutdown_rx: watch::Receiver<bool>,
    _shutdown_tx: watch::Sender<bool>,
}

async fn start_gateway(resolver: Arc<dyn LocationResolver>, mods: &[&str]) -> Gateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mods: Vec<String> = mods.iter().map(|m| m.to_string()).collect();
    let parser = RouteParser::new(Arc::new(mods));
    let pool = Arc::new(ProxyPool::new(resolver, PoolSettings::default()));

    let server = ProxyServer::new(addr, parser, Arc::clone(&pool), shutdown_rx.clone());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    Gateway {
        addr,
        pool,
        shutdown_rx,
        _shutdown_tx: shutdown_tx,
    }
}

fn static_resolver(backends: &[(&str, BackendConfig)]) -> Arc<StaticResolver> {
    let backends: HashMap<String, BackendConfig> = backends
        .iter()
        .map(|(kind, backend)| (kind.to_string(), backend.clone()))
        .collect();
    Arc::new(StaticResolver::new(backends))
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn http_get_with_headers(addr: SocketAddr, path: &str, extra: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\n{}Connection: close\r\n\r\n",
        path, addr, extra
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    http_get_with_headers(addr, path, "").await
}

fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn has_header(response: &str, name: &str) -> bool {
    let head = response.split("\r\n\r\n").next().unwrap_or("");
    head.lines()
        .any(|line| line.to_ascii_lowercase().starts_with(&format!("{}:", name)))
}

fn source(info_hash: &str, path: &str) -> Source {
    Source {
        kind: "default".to_string(),
        info_hash: info_hash.to_string(),
        path: path.to_string(),
        token: String::new(),
        modifier: None,
    }
}

#[tokio::test]
async fn test_forwards_request_and_strips_cors_headers() {
    let upstream = start_upstream().await;
    let resolver = static_resolver(&[("default", BackendConfig::new("127.0.0.1", upstream.port()))]);
    let gateway = start_gateway(resolver, &[]).await;

    let response = http_get_with_headers(
        gateway.addr,
        "/abc12/videos/ep1.mp4?token=t1",
        "X-Request-Id: req-42\r\n",
    )
    .await;

    assert_eq!(status_of(&response), 200, "response: {}", response);
    assert!(response.contains("path=/abc12/videos/ep1.mp4?token=t1"));
    assert!(response.contains("xff=127.0.0.1"));
    assert!(response.contains("rid=req-42"));
    assert!(has_header(&response, "x-upstream"));
    assert!(!has_header(&response, "access-control-allow-origin"));
    assert!(!has_header(&response, "access-control-allow-credentials"));
}

#[tokio::test]
async fn test_encoded_path_is_decoded_for_routing_only() {
    let upstream = start_upstream().await;
    let resolver = static_resolver(&[("default", BackendConfig::new("127.0.0.1", upstream.port()))]);
    let gateway = start_gateway(resolver, &[]).await;

    let response = http_get(gateway.addr, "/abc12/my%20file.mp4").await;

    assert_eq!(status_of(&response), 200);
    assert!(response.contains("path=/abc12/my%20file.mp4"));
    assert!(gateway.pool.contains(&source("abc12", "/my file.mp4"), false));
}

#[tokio::test]
async fn test_non_utf8_escape_still_routes() {
    let upstream = start_upstream().await;
    let resolver = static_resolver(&[("default", BackendConfig::new("127.0.0.1", upstream.port()))]);
    let gateway = start_gateway(resolver, &[]).await;

    let response = http_get(gateway.addr, "/abc12/%ff?token=ok%ffx&token=second").await;

    assert_eq!(status_of(&response), 200, "response: {}", response);
    assert!(response.contains("path=/abc12/%ff?token=ok%ffx&token=second"));
    assert!(gateway.pool.contains(&source("abc12", "/\u{FFFD}"), false));
}

#[tokio::test]
async fn test_invalid_hash_returns_json_error() {
    let resolver = static_resolver(&[]);
    let gateway = start_gateway(resolver, &[]).await;

    let response = http_get(gateway.addr, "/zzzz/file").await;

    assert_eq!(status_of(&response), 400);
    assert!(has_header(&response, "x-proxy-error"));
    assert!(response.contains("INVALID_HASH"));
    assert!(response.contains("wrong hash=zzzz"));
    assert!(gateway.pool.is_empty());
}

#[tokio::test]
async fn test_empty_path_returns_invalid_request() {
    let resolver = static_resolver(&[]);
    let gateway = start_gateway(resolver, &[]).await;

    let response = http_get(gateway.addr, "/").await;

    assert_eq!(status_of(&response), 400);
    assert!(response.contains("INVALID_REQUEST"));
    assert!(response.contains("empty url"));
}

#[tokio::test]
async fn test_unavailable_backend_returns_bare_503() {
    let mut backend = BackendConfig::new("127.0.0.1", 1);
    backend.unavailable = true;
    let resolver = static_resolver(&[("default", backend)]);
    let gateway = start_gateway(resolver, &[]).await;

    let response = http_get(gateway.addr, "/abc12/file").await;

    assert_eq!(status_of(&response), 503);
    assert!(!has_header(&response, "x-proxy-error"));
    assert!(gateway.pool.contains(&source("abc12", "/file"), false));
}

#[tokio::test]
async fn test_mod_without_backend_is_location_unavailable() {
    let upstream = start_upstream().await;
    let resolver = static_resolver(&[("default", BackendConfig::new("127.0.0.1", upstream.port()))]);
    let gateway = start_gateway(resolver, &["resize"]).await;

    let response = http_get(gateway.addr, "/resize/anything").await;

    assert_eq!(status_of(&response), 503);
    assert!(response.contains("LOCATION_UNAVAILABLE"));
    // The failure stays cached until the entry expires
    assert_eq!(gateway.pool.len(), 1);
}

struct MovingResolver {
    stale: SocketAddr,
    fresh: SocketAddr,
    refreshes: AtomicUsize,
}

#[async_trait]
impl LocationResolver for MovingResolver {
    async fn get_location(&self, _source: &Source, _invoke: bool) -> anyhow::Result<Location> {
        Ok(Location::new(self.stale))
    }

    async fn refresh(&self, _source: &Source, _invoke: bool) -> anyhow::Result<Location> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(Location::new(self.fresh))
    }
}

#[tokio::test]
async fn test_failed_dial_refreshes_location_and_retries() {
    let upstream = start_upstream().await;
    let resolver = Arc::new(MovingResolver {
        stale: dead_addr().await,
        fresh: upstream,
        refreshes: AtomicUsize::new(0),
    });
    let gateway = start_gateway(resolver.clone(), &[]).await;

    let response = http_get(gateway.addr, "/abc12/file").await;

    assert_eq!(status_of(&response), 200, "response: {}", response);
    assert!(response.contains("path=/abc12/file"));
    assert_eq!(resolver.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_both_dials_failing_returns_bad_gateway() {
    let resolver = Arc::new(MovingResolver {
        stale: dead_addr().await,
        fresh: dead_addr().await,
        refreshes: AtomicUsize::new(0),
    });
    let gateway = start_gateway(resolver.clone(), &[]).await;

    let response = http_get(gateway.addr, "/abc12/file").await;

    assert_eq!(status_of(&response), 502);
    assert!(response.contains("DIAL_FAILURE"));
    assert_eq!(resolver.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invoke_mode_gets_its_own_proxy() {
    let upstream = start_upstream().await;
    let resolver = static_resolver(&[("default", BackendConfig::new("127.0.0.1", upstream.port()))]);
    let gateway = start_gateway(resolver, &[]).await;

    assert_eq!(status_of(&http_get(gateway.addr, "/abc12/file").await), 200);
    assert_eq!(status_of(&http_get(gateway.addr, "/abc12/file?invoke=true").await), 200);
    assert_eq!(status_of(&http_get(gateway.addr, "/abc12/file?invoke=1").await), 200);

    assert_eq!(gateway.pool.len(), 2);
    assert!(gateway.pool.contains(&source("abc12", "/file"), true));
    assert_eq!(gateway.pool.stats().get_misses(), 2);
    assert_eq!(gateway.pool.stats().get_hits(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_proxy() {
    let upstream = start_upstream().await;
    let resolver = static_resolver(&[("default", BackendConfig::new("127.0.0.1", upstream.port()))]);
    let gateway = start_gateway(resolver, &[]).await;

    let requests = (0..20).map(|_| http_get(gateway.addr, "/abc12/videos/ep1.mp4?token=x"));
    let responses = futures::future::join_all(requests).await;

    assert!(responses.iter().all(|r| status_of(r) == 200));
    assert_eq!(gateway.pool.len(), 1);
    assert_eq!(gateway.pool.stats().get_misses(), 1);
    assert_eq!(gateway.pool.stats().get_hits(), 19);
}

#[tokio::test]
async fn test_admin_reports_pool_snapshot() {
    let upstream = start_upstream().await;
    let resolver = static_resolver(&[("default", BackendConfig::new("127.0.0.1", upstream.port()))]);
    let gateway = start_gateway(resolver, &[]).await;

    assert_eq!(status_of(&http_get(gateway.addr, "/abc12/file").await), 200);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_addr = listener.local_addr().unwrap();
    let admin = AdminServer::new(
        admin_addr,
        Arc::clone(&gateway.pool),
        gateway.shutdown_rx.clone(),
        "secret".to_string(),
    );
    tokio::spawn(async move {
        let _ = admin.serve(listener).await;
    });

    let unauthorized = http_get(admin_addr, "/pool").await;
    assert_eq!(status_of(&unauthorized), 401);

    let response = http_get_with_headers(admin_addr, "/pool", "Authorization: Bearer secret\r\n").await;
    assert_eq!(status_of(&response), 200);
    assert!(response.contains("\"entries\":1"));
    assert!(response.contains("\"misses\":1"));
}
