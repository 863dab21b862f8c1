//! Reverse proxy handle and its transports
//!
//! A [`ReverseProxy`] forwards requests to a single backend location. Known-down
//! locations get a stub transport that answers 503 without touching the
//! network; live ones get a pooled HTTP client whose connector retries a
//! failed dial once against a freshly resolved location.

use crate::config::PoolSettings;
use crate::error::GatewayError;
use crate::resolver::{Location, LocationResolver};
use crate::source::Source;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, CONNECTION};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

/// Body type of every response handed back to the dispatch layer
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Upstream headers removed before the response reaches the client.
/// The gateway applies its own CORS policy.
const STRIPPED_RESPONSE_HEADERS: [&str; 2] = [
    "access-control-allow-credentials",
    "access-control-allow-origin",
];

/// Hop-by-hop headers that must not be forwarded upstream
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Connector that dials the backend and, on failure, refreshes the
/// location through the resolver and dials the new address once.
#[derive(Clone)]
pub struct RefreshingConnector {
    source: Arc<Source>,
    invoke: bool,
    resolver: Arc<dyn LocationResolver>,
    dial_timeout: Duration,
}

impl RefreshingConnector {
    pub fn new(
        source: Arc<Source>,
        invoke: bool,
        resolver: Arc<dyn LocationResolver>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            source,
            invoke,
            resolver,
            dial_timeout,
        }
    }

    /// At most two dial attempts with a single resolver refresh in between
    pub async fn dial(&self, addr: SocketAddr) -> Result<TcpStream, GatewayError> {
        debug!(addr = %addr, info_hash = %self.source.info_hash, "Dialing proxy backend");

        let first_err = match connect(addr, self.dial_timeout).await {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };
        warn!(addr = %addr, error = %first_err, "Failed to dial location, refreshing it");

        let location = self
            .resolver
            .refresh(&self.source, self.invoke)
            .await
            .map_err(|e| {
                error!(info_hash = %self.source.info_hash, error = %e, "Failed to get new location");
                GatewayError::LocationUnavailable(format!("{:#}", e))
            })?;

        let retry_addr = location.addr();
        connect(retry_addr, self.dial_timeout).await.map_err(|e| {
            error!(addr = %retry_addr, error = %e, "Failed to dial with new address");
            GatewayError::DialFailure(format!(
                "{} failed ({}), {} after refresh failed ({})",
                addr, first_err, retry_addr, e
            ))
        })
    }
}

async fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn uri_addr(uri: &Uri) -> Result<SocketAddr, GatewayError> {
    let host = uri
        .host()
        .ok_or_else(|| GatewayError::DialFailure(format!("missing host in {}", uri)))?;
    let ip: IpAddr = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|_| GatewayError::DialFailure(format!("invalid backend address {}", host)))?;
    Ok(SocketAddr::new(ip, uri.port_u16().unwrap_or(80)))
}

impl tower_service::Service<Uri> for RefreshingConnector {
    type Response = TokioIo<TcpStream>;
    type Error = GatewayError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move {
            let addr = uri_addr(&uri)?;
            let stream = connector.dial(addr).await?;
            Ok(TokioIo::new(stream))
        })
    }
}

enum Transport {
    /// Backend is known to be down; every request gets a bare 503
    Unavailable,
    Http(Client<RefreshingConnector, ProxyBody>),
}

/// Single-host reverse proxy bound to one resolved location
pub struct ReverseProxy {
    target: SocketAddr,
    transport: Transport,
}

impl ReverseProxy {
    pub fn new(location: Location, connector: RefreshingConnector, settings: &PoolSettings) -> Self {
        let transport = if location.unavailable {
            Transport::Unavailable
        } else {
            let client = Client::builder(TokioExecutor::new())
                .pool_max_idle_per_host(settings.max_idle_per_host)
                .pool_idle_timeout(settings.idle_timeout())
                .pool_timer(TokioTimer::new())
                .build(connector);
            Transport::Http(client)
        };

        Self {
            target: location.addr(),
            transport,
        }
    }

    /// Address requests are sent to
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Whether this proxy short-circuits requests with 503
    pub fn is_unavailable(&self) -> bool {
        matches!(self.transport, Transport::Unavailable)
    }

    /// Forward a request to the backend and return its response with the
    /// upstream CORS headers removed
    pub async fn forward<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, GatewayError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let client = match &self.transport {
            Transport::Unavailable => return Ok(unavailable_response()),
            Transport::Http(client) => client,
        };

        let (mut parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = format!("http://{}{}", self.target, path_and_query)
            .parse()
            .map_err(|e| GatewayError::Upstream(format!("invalid upstream uri: {}", e)))?;
        parts.version = Version::HTTP_11;
        remove_hop_by_hop_headers(&mut parts.headers);

        let response = client
            .request(Request::from_parts(parts, body.boxed()))
            .await
            .map_err(classify_client_error)?;

        let (mut parts, body) = response.into_parts();
        strip_response_headers(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

impl fmt::Debug for ReverseProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReverseProxy")
            .field("target", &self.target)
            .field("unavailable", &self.is_unavailable())
            .finish()
    }
}

/// Fixed 503 with empty body and no headers
fn unavailable_response() -> Response<ProxyBody> {
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    response
}

pub fn strip_response_headers(headers: &mut HeaderMap) {
    for name in STRIPPED_RESPONSE_HEADERS {
        headers.remove(name);
    }
}

fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    // Headers listed in Connection are hop-by-hop too
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Recover the connector's own error from the client error chain
fn classify_client_error(err: hyper_util::client::legacy::Error) -> GatewayError {
    let mut source = std::error::Error::source(&err);
    while let Some(e) = source {
        if let Some(gateway) = e.downcast_ref::<GatewayError>() {
            return gateway.clone();
        }
        source = e.source();
    }

    if err.is_connect() {
        GatewayError::DialFailure(format!("{:?}", err))
    } else {
        GatewayError::Upstream(format!("{:?}", err))
    }
}
