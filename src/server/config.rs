//! Event bus configuration

use std::time::Duration;

use crate::error::{Error, Result};

/// Environment override for the advertised cluster host.
///
/// Retained for backward compatibility; takes precedence over
/// [`EventBusOptions::cluster_public_host`].
pub const CLUSTER_PUBLIC_HOST_PROP: &str = "vertx.cluster.public.host";

/// Environment override for the advertised cluster port.
///
/// Retained for backward compatibility; takes precedence over
/// [`EventBusOptions::cluster_public_port`].
pub const CLUSTER_PUBLIC_PORT_PROP: &str = "vertx.cluster.public.port";

/// Clustered event bus options
///
/// The advertised (public) address may differ from the bind address
/// when the node sits behind NAT or binds a wildcard. Public values
/// left unset fall back to the bind host and the actual bound port.
#[derive(Debug, Clone)]
pub struct EventBusOptions {
    /// Host the peer listener binds to
    pub cluster_host: String,

    /// Port the peer listener binds to (0 = any free port)
    pub cluster_port: u16,

    /// Advertised host; `None` falls back to `cluster_host`
    pub cluster_public_host: Option<String>,

    /// Advertised port; `None` falls back to the actual bound port
    pub cluster_public_port: Option<u16>,

    /// Keepalive interval on outbound connections
    pub ping_interval: Duration,

    /// Timeout for establishing an outbound connection
    pub connect_timeout: Duration,

    /// Reply timeout used by `request`
    pub reply_timeout: Duration,

    /// Capacity of each peer connection's pending-write queue;
    /// messages past it are dropped
    pub pending_queue_capacity: usize,

    /// Largest wire record accepted before the connection is closed
    pub max_record_size: usize,
}

impl Default for EventBusOptions {
    fn default() -> Self {
        Self {
            cluster_host: "127.0.0.1".to_string(),
            cluster_port: 0,
            cluster_public_host: None,
            cluster_public_port: None,
            ping_interval: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(60),
            reply_timeout: Duration::from_secs(30),
            pending_queue_capacity: 1024,
            max_record_size: 16 * 1024 * 1024,
        }
    }
}

impl EventBusOptions {
    /// Set the bind host
    pub fn cluster_host(mut self, host: impl Into<String>) -> Self {
        self.cluster_host = host.into();
        self
    }

    /// Set the bind port (0 = any free port)
    pub fn cluster_port(mut self, port: u16) -> Self {
        self.cluster_port = port;
        self
    }

    /// Set the advertised host
    pub fn cluster_public_host(mut self, host: impl Into<String>) -> Self {
        self.cluster_public_host = Some(host.into());
        self
    }

    /// Set the advertised port
    pub fn cluster_public_port(mut self, port: u16) -> Self {
        self.cluster_public_port = Some(port);
        self
    }

    /// Set the keepalive interval
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the outbound connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the reply timeout used by `request`
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the pending-write queue capacity
    pub fn pending_queue_capacity(mut self, capacity: usize) -> Self {
        self.pending_queue_capacity = capacity;
        self
    }

    /// Validate the options, rejecting zero-valued intervals and sizes.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_host.is_empty() {
            return Err(Error::Config("cluster_host must not be empty".into()));
        }
        if self.ping_interval.is_zero() {
            return Err(Error::Config("ping_interval must be > 0".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config("connect_timeout must be > 0".into()));
        }
        if self.reply_timeout.is_zero() {
            return Err(Error::Config("reply_timeout must be > 0".into()));
        }
        if self.pending_queue_capacity == 0 {
            return Err(Error::Config("pending_queue_capacity must be > 0".into()));
        }
        if self.max_record_size == 0 {
            return Err(Error::Config("max_record_size must be > 0".into()));
        }
        Ok(())
    }

    /// Resolve the advertised host: environment override, then the
    /// configured public host, then the bind host.
    ///
    /// Read once during startup.
    pub(crate) fn resolve_public_host(&self) -> String {
        if let Ok(host) = std::env::var(CLUSTER_PUBLIC_HOST_PROP) {
            if !host.is_empty() {
                return host;
            }
        }
        self.cluster_public_host
            .clone()
            .unwrap_or_else(|| self.cluster_host.clone())
    }

    /// Resolve the advertised port: environment override, then the
    /// configured public port, then the actual bound port.
    ///
    /// Read once during startup.
    pub(crate) fn resolve_public_port(&self, actual_port: u16) -> u16 {
        if let Ok(raw) = std::env::var(CLUSTER_PUBLIC_PORT_PROP) {
            match raw.parse::<u16>() {
                Ok(port) => return port,
                Err(_) => {
                    tracing::warn!(value = %raw, "ignoring unparsable {}", CLUSTER_PUBLIC_PORT_PROP);
                }
            }
        }
        self.cluster_public_port.unwrap_or(actual_port)
    }
}
