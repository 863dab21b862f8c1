//! Proxy instance: one lazily constructed reverse proxy per pool entry
//!
//! Construction resolves the backend location and builds the transport. The
//! first `get` starts it on its own task, so a caller that goes away mid-way
//! (a client disconnect) does not cancel it and it still runs exactly once.
//! Every caller waits on a `watch` channel for the single result. A failed
//! construction is memoized too and is only retried once the pool evicts the
//! instance.

use crate::config::PoolSettings;
use crate::error::GatewayError;
use crate::resolver::LocationResolver;
use crate::source::Source;
use crate::transport::{RefreshingConnector, ReverseProxy};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

type BuildResult = Result<Arc<ReverseProxy>, GatewayError>;

pub struct ProxyInstance {
    source: Arc<Source>,
    invoke: bool,
    resolver: Arc<dyn LocationResolver>,
    settings: PoolSettings,
    /// Taken by the first `get`, which hands it to the construction task
    publisher: Mutex<Option<watch::Sender<Option<BuildResult>>>>,
    result: watch::Receiver<Option<BuildResult>>,
}

impl ProxyInstance {
    pub fn new(
        source: Source,
        invoke: bool,
        resolver: Arc<dyn LocationResolver>,
        settings: PoolSettings,
    ) -> Self {
        let (publisher, result) = watch::channel(None);
        Self {
            source: Arc::new(source),
            invoke,
            resolver,
            settings,
            publisher: Mutex::new(Some(publisher)),
            result,
        }
    }

    /// Get the reverse proxy, constructing it on first use
    pub async fn get(&self) -> BuildResult {
        self.start();

        // The sender only closes early if the construction task panicked
        let aborted = || GatewayError::LocationUnavailable("proxy construction aborted".to_string());
        let mut result = self.result.clone();
        let built = result.wait_for(|r| r.is_some()).await.map_err(|_| aborted())?;
        let outcome = (*built).clone();
        outcome.unwrap_or_else(|| Err(aborted()))
    }

    /// Whether construction has completed (successfully or not)
    pub fn is_initialized(&self) -> bool {
        self.result.borrow().is_some()
    }

    fn start(&self) {
        let Some(publisher) = self.publisher.lock().take() else {
            return;
        };

        let source = Arc::clone(&self.source);
        let invoke = self.invoke;
        let resolver = Arc::clone(&self.resolver);
        let settings = self.settings.clone();

        tokio::spawn(async move {
            let outcome = build(source, invoke, resolver, settings).await;
            publisher.send_replace(Some(outcome));
        });
    }
}

async fn build(
    source: Arc<Source>,
    invoke: bool,
    resolver: Arc<dyn LocationResolver>,
    settings: PoolSettings,
) -> BuildResult {
    let location = resolver.get_location(&source, invoke).await.map_err(|e| {
        error!(
            info_hash = %source.info_hash,
            kind = %source.kind,
            error = %e,
            "Failed to get location"
        );
        GatewayError::LocationUnavailable(format!("{:#}", e))
    })?;

    let connector = RefreshingConnector::new(
        Arc::clone(&source),
        invoke,
        Arc::clone(&resolver),
        settings.dial_timeout(),
    );
    let proxy = ReverseProxy::new(location, connector, &settings);

    info!(
        info_hash = %source.info_hash,
        kind = %source.kind,
        target = %proxy.target(),
        unavailable = location.unavailable,
        "Proxy constructed"
    );
    Ok(Arc::new(proxy))
}
