use crate::resolver::ModRegistry;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Proxy pool settings
    #[serde(default)]
    pub pool: PoolSettings,

    /// Recognized mod names, used for direct mod routes and `~mod` suffixes
    #[serde(default)]
    pub mods: Vec<String>,

    /// Backend per source type ("default" or a mod name)
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port for proxied traffic
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the internal admin API, bound to localhost
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin pool endpoint
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolSettings {
    /// Seconds of inactivity before a cached proxy is evicted
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Timeout for each dial attempt in seconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Maximum idle connections kept per backend host
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,

    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl PoolSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            dial_timeout_secs: default_dial_timeout(),
            max_idle_per_host: default_max_idle_per_host(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

/// Backend serving one source type
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Hostname or IP address, resolved on first use and on refresh
    pub host: String,

    /// HTTP port of the backend
    pub port: u16,

    /// Mark the backend as down: requests get a 503 without dialing
    #[serde(default)]
    pub unavailable: bool,
}

impl BackendConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            unavailable: false,
        }
    }

    /// Validate the backend configuration
    pub fn validate(&self, kind: &str) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err(format!("Backend '{}': 'host' must not be empty", kind));
        }

        if self.port == 0 {
            return Err(format!("Backend '{}': 'port' must be greater than 0", kind));
        }

        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9090
}

fn default_ttl() -> u64 {
    60
}

fn default_dial_timeout() -> u64 {
    10
}

fn default_max_idle_per_host() -> usize {
    100
}

fn default_idle_timeout() -> u64 {
    90
}

/// Upper bound for pool durations, keeps deadline arithmetic in range
const MAX_POOL_SECS: u64 = 86_400;

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.pool.ttl_secs == 0 {
            errors.push("Pool: 'ttl_secs' must be greater than 0".to_string());
        }

        if self.pool.dial_timeout_secs == 0 {
            errors.push("Pool: 'dial_timeout_secs' must be greater than 0".to_string());
        }

        for (name, secs) in [
            ("ttl_secs", self.pool.ttl_secs),
            ("dial_timeout_secs", self.pool.dial_timeout_secs),
            ("idle_timeout_secs", self.pool.idle_timeout_secs),
        ] {
            if secs > MAX_POOL_SECS {
                errors.push(format!("Pool: '{}' must be at most {}", name, MAX_POOL_SECS));
            }
        }

        for (kind, backend) in &self.backends {
            if let Err(e) = backend.validate(kind) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

impl ModRegistry for Config {
    fn mods(&self) -> &[String] {
        &self.mods
    }
}
