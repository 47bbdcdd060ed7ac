//! Gateway configuration.
//!
//! Process-level settings only; listeners, routes and backends come from the
//! resource file.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::proxy::ProxyLimits;
use crate::runtime::RuntimeOptions;

/// Gateway configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// YAML or JSON file holding the resource set.
    pub resources_path: PathBuf,

    /// How often the resource file is checked for changes.
    pub reload_poll_interval: Duration,

    /// Window over which resource changes are batched before a rebuild.
    pub rebuild_debounce: Duration,

    pub connect_timeout: Duration,

    /// Concurrent connections per TCP listener.
    pub max_connections: usize,

    /// Largest request body buffered for retries.
    pub max_replay_body_bytes: usize,

    pub udp_idle_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let resources_path = std::env::var("EDGEWAY_RESOURCES")
            .map(PathBuf::from)
            .context("Missing resource file. Set EDGEWAY_RESOURCES.")?;

        let poll_interval_ms: u64 = std::env::var("EDGEWAY_RELOAD_POLL_INTERVAL_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("EDGEWAY_RELOAD_POLL_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(1000);
        let reload_poll_interval = Duration::from_millis(poll_interval_ms.max(50));

        let debounce_ms: u64 = std::env::var("EDGEWAY_REBUILD_DEBOUNCE_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("EDGEWAY_REBUILD_DEBOUNCE_MS must be an integer (milliseconds).")?
            .unwrap_or(2000);

        let connect_timeout_ms: u64 = std::env::var("EDGEWAY_CONNECT_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("EDGEWAY_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(2000);

        let max_connections: usize = std::env::var("EDGEWAY_MAX_CONNECTIONS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("EDGEWAY_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(10_000)
            .max(1);

        let max_replay_body_bytes: usize = std::env::var("EDGEWAY_MAX_REPLAY_BODY_BYTES")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("EDGEWAY_MAX_REPLAY_BODY_BYTES must be an integer (bytes).")?
            .unwrap_or(1024 * 1024);

        let udp_idle_secs: u64 = std::env::var("EDGEWAY_UDP_IDLE_TIMEOUT_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("EDGEWAY_UDP_IDLE_TIMEOUT_SECS must be an integer (seconds).")?
            .unwrap_or(60);

        let log_level = std::env::var("EDGEWAY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            resources_path,
            reload_poll_interval,
            rebuild_debounce: Duration::from_millis(debounce_ms),
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            max_connections,
            max_replay_body_bytes,
            udp_idle_timeout: Duration::from_secs(udp_idle_secs.max(1)),
            log_level,
        })
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            debounce: self.rebuild_debounce,
            connect_timeout: self.connect_timeout,
            limits: ProxyLimits {
                max_connections: self.max_connections,
                max_replay_body_bytes: self.max_replay_body_bytes,
                udp_idle_timeout: self.udp_idle_timeout,
                ..ProxyLimits::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_options_carry_limits() {
        let config = Config {
            resources_path: PathBuf::from("/etc/edgeway/resources.yaml"),
            reload_poll_interval: Duration::from_secs(1),
            rebuild_debounce: Duration::from_millis(250),
            connect_timeout: Duration::from_millis(500),
            max_connections: 16,
            max_replay_body_bytes: 4096,
            udp_idle_timeout: Duration::from_secs(5),
            log_level: "debug".to_string(),
        };

        let options = config.runtime_options();
        assert_eq!(options.debounce, Duration::from_millis(250));
        assert_eq!(options.connect_timeout, Duration::from_millis(500));
        assert_eq!(options.limits.max_connections, 16);
        assert_eq!(options.limits.max_replay_body_bytes, 4096);
        assert_eq!(options.limits.udp_idle_timeout, Duration::from_secs(5));
        assert!(options.limits.stream_idle_timeout.is_none());
    }
}
