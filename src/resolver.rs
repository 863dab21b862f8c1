//! Backend location resolution
//!
//! The pool never owns backend addresses. It asks a [`LocationResolver`] for
//! the current [`Location`] of a source and, after a failed dial, asks it to
//! refresh that location.

use crate::config::BackendConfig;
use crate::source::Source;
use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info};

/// Network location of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub ip: IpAddr,
    /// HTTP port
    pub http: u16,
    /// Backend is known to be down; requests are answered with 503 without dialing
    pub unavailable: bool,
}

impl Location {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            http: addr.port(),
            unavailable: false,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.http)
    }
}

/// Maps a source to a live backend location
#[async_trait]
pub trait LocationResolver: Send + Sync {
    /// Current best-known location for a source
    async fn get_location(&self, source: &Source, invoke: bool) -> anyhow::Result<Location>;

    /// Force re-resolution, used after a failed dial
    async fn refresh(&self, source: &Source, invoke: bool) -> anyhow::Result<Location>;
}

/// The set of recognized mod names
pub trait ModRegistry: Send + Sync {
    fn mods(&self) -> &[String];

    fn is_mod(&self, name: &str) -> bool {
        self.mods().iter().any(|m| m == name)
    }
}

impl ModRegistry for Vec<String> {
    fn mods(&self) -> &[String] {
        self
    }
}

/// Resolver backed by the `[backends.<type>]` configuration tables.
///
/// Hostnames are looked up once and cached per source type; `refresh`
/// drops the cached entry and looks the host up again.
pub struct StaticResolver {
    backends: HashMap<String, BackendConfig>,
    cache: DashMap<String, Location>,
}

impl StaticResolver {
    pub fn new(backends: HashMap<String, BackendConfig>) -> Self {
        Self {
            backends,
            cache: DashMap::new(),
        }
    }

    async fn lookup(&self, kind: &str) -> anyhow::Result<Location> {
        let backend = self
            .backends
            .get(kind)
            .ok_or_else(|| anyhow::anyhow!("No backend configured for source type '{}'", kind))?;

        let addr = tokio::net::lookup_host((backend.host.as_str(), backend.port))
            .await
            .with_context(|| format!("Failed to resolve backend host {}", backend.host))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("No addresses found for backend host {}", backend.host))?;

        let location = Location {
            ip: addr.ip(),
            http: addr.port(),
            unavailable: backend.unavailable,
        };
        debug!(kind, addr = %addr, unavailable = backend.unavailable, "Resolved backend location");

        self.cache.insert(kind.to_string(), location);
        Ok(location)
    }
}

#[async_trait]
impl LocationResolver for StaticResolver {
    async fn get_location(&self, source: &Source, _invoke: bool) -> anyhow::Result<Location> {
        if let Some(location) = self.cache.get(&source.kind) {
            return Ok(*location);
        }
        self.lookup(&source.kind).await
    }

    async fn refresh(&self, source: &Source, _invoke: bool) -> anyhow::Result<Location> {
        self.cache.remove(&source.kind);
        let location = self.lookup(&source.kind).await?;
        info!(kind = %source.kind, addr = %location.addr(), "Backend location refreshed");
        Ok(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::DEFAULT_SOURCE_TYPE;

    fn source(kind: &str) -> Source {
        Source {
            kind: kind.to_string(),
            info_hash: "abc12".to_string(),
            path: "/".to_string(),
            token: String::new(),
            modifier: None,
        }
    }

    fn resolver() -> StaticResolver {
        let mut backends = HashMap::new();
        backends.insert(DEFAULT_SOURCE_TYPE.to_string(), BackendConfig::new("127.0.0.1", 8081));
        let mut down = BackendConfig::new("127.0.0.2", 8082);
        down.unavailable = true;
        backends.insert("resize".to_string(), down);
        StaticResolver::new(backends)
    }

    #[test]
    fn test_mod_registry_for_vec() {
        let mods = vec!["resize".to_string(), "vtt".to_string()];
        assert!(mods.is_mod("vtt"));
        assert!(!mods.is_mod("foo"));
        assert_eq!(mods.mods().len(), 2);
    }

    #[tokio::test]
    async fn test_resolves_configured_backend() {
        let resolver = resolver();
        let location = resolver
            .get_location(&source(DEFAULT_SOURCE_TYPE), false)
            .await
            .unwrap();

        assert_eq!(location.addr(), "127.0.0.1:8081".parse::<SocketAddr>().unwrap());
        assert!(!location.unavailable);
    }

    #[tokio::test]
    async fn test_unavailable_flag_is_carried() {
        let resolver = resolver();
        let location = resolver.get_location(&source("resize"), true).await.unwrap();
        assert!(location.unavailable);
    }

    #[tokio::test]
    async fn test_unknown_type_fails() {
        let resolver = resolver();
        let err = resolver.get_location(&source("vtt"), false).await.unwrap_err();
        assert!(err.to_string().contains("No backend configured"));
    }

    #[tokio::test]
    async fn test_refresh_repopulates_cache() {
        let resolver = resolver();
        let src = source(DEFAULT_SOURCE_TYPE);
        let first = resolver.get_location(&src, false).await.unwrap();
        let refreshed = resolver.refresh(&src, false).await.unwrap();

        assert_eq!(first, refreshed);
        assert!(resolver.cache.contains_key(DEFAULT_SOURCE_TYPE));
    }
}
