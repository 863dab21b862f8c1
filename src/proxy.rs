use crate::error::GatewayError;
use crate::parser::{query_param, RouteParser};
use crate::pool::ProxyPool;
use crate::transport::ProxyBody;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Query parameter selecting the invoke mode of the backend
const INVOKE_PARAM: &str = "invoke";

/// The gateway's HTTP front: parses the routing key from the path, picks the
/// cached proxy for it and forwards the request
pub struct ProxyServer {
    bind_addr: SocketAddr,
    parser: RouteParser,
    pool: Arc<ProxyPool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        parser: RouteParser,
        pool: Arc<ProxyPool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            parser,
            pool,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let parser = self.parser.clone();
                            let pool = Arc::clone(&self.pool);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, parser, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    parser: RouteParser,
    pool: Arc<ProxyPool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let parser = parser.clone();
        let pool = Arc::clone(&pool);
        async move { handle_request(req, parser, pool, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    parser: RouteParser,
    pool: Arc<ProxyPool>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // We overwrite X-Forwarded-* rather than append; this gateway is the first trusted hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    // Escapes that are not valid UTF-8 decode lossily and still route
    let path = String::from_utf8_lossy(&urlencoding::decode_binary(req.uri().path().as_bytes()))
        .into_owned();
    let query = req.uri().query().map(String::from);

    let source = match parser.parse(&path, query.as_deref()) {
        Ok(source) => source,
        Err(e) => return Ok(reject(e, &request_id)),
    };

    let invoke = query
        .as_deref()
        .and_then(|q| query_param(q, INVOKE_PARAM))
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    debug!(
        method = %req.method(),
        uri = %req.uri(),
        info_hash = %source.info_hash,
        kind = %source.kind,
        path = %source.path,
        modifier = ?source.modifier.as_ref().map(|m| m.kind.as_str()),
        invoke,
        request_id,
        "Incoming request"
    );

    let proxy = match pool.get(&source, invoke).await {
        Ok(proxy) => proxy,
        Err(e) => return Ok(reject(e, &request_id)),
    };

    match proxy.forward(req).await {
        Ok(response) => Ok(response),
        Err(e) => Ok(reject(e, &request_id)),
    }
}

/// Log the failure and turn it into a JSON error response
fn reject(err: GatewayError, request_id: &str) -> Response<ProxyBody> {
    if err.is_client_error() {
        debug!(request_id, error = %err, "Rejected request");
    } else {
        error!(request_id, error = %err, "Failed to route request");
    }
    err.to_response()
}
