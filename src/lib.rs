//! Streamgate - A path-routed HTTP gateway in front of torrent streaming backends
//!
//! This library provides a reverse proxy that:
//! - Parses a content source (info-hash, path, optional `~mod` suffix) from the request path
//! - Resolves the backend location serving that source type
//! - Caches one lazily built reverse proxy per source and mode, evicted after inactivity
//! - Refreshes the location and redials once when a backend connection fails
//! - Strips backend CORS headers so the gateway's own policy applies

pub mod admin;
pub mod config;
pub mod error;
pub mod instance;
pub mod parser;
pub mod pool;
pub mod proxy;
pub mod resolver;
pub mod source;
pub mod transport;
