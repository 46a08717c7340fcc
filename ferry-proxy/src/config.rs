//! Proxy configuration.

use std::sync::Arc;
use std::time::Duration;

use ferry_core::Limits;

use crate::error::{ProxyError, ProxyResult};

/// Configuration for the proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// TCP port the proxy listens on.
    pub port: u16,
    /// Cluster nodes queried for the initial topology, in order.
    pub startup_nodes: Vec<Arc<str>>,
    /// Idle client connections are closed after this long without a request.
    pub client_idle_timeout: Duration,
    /// Maximum time to wait for one backend reply.
    pub backend_read_timeout: Duration,
    /// Minimum time between two topology reloads.
    pub slot_reload_interval: Duration,
    /// Persistent connections per backend address.
    pub backend_connections: usize,
    /// Idle connections kept per address in the pool.
    pub pool_max_idle: usize,
    /// Timeout for dialing a backend.
    pub pool_dial_timeout: Duration,
    /// Capacity of the dispatcher's central request queue.
    pub dispatch_queue_size: usize,
    /// Capacity of each task runner's input queue.
    pub backend_queue_size: usize,
    /// Capacity of each session's response channel.
    pub session_channel_size: usize,
    /// Unanswered requests allowed per backend connection.
    pub pipeline_depth: usize,
    /// Redirections followed per request before the reply is surfaced.
    pub redirect_limit: u8,
}

impl ProxyConfig {
    /// Creates a configuration with production defaults.
    #[must_use]
    pub fn new(port: u16, startup_nodes: Vec<Arc<str>>) -> Self {
        Self {
            port,
            startup_nodes,
            client_idle_timeout: Duration::from_secs(120),
            backend_read_timeout: Duration::from_secs(5),
            slot_reload_interval: Duration::from_secs(1),
            backend_connections: 2,
            pool_max_idle: 8,
            pool_dial_timeout: Duration::from_secs(1),
            dispatch_queue_size: 10_000,
            backend_queue_size: 5_000,
            session_channel_size: 1_000,
            pipeline_depth: 512,
            redirect_limit: 2,
        }
    }

    /// Sets the client idle timeout.
    #[must_use]
    pub fn with_client_idle_timeout(mut self, timeout: Duration) -> Self {
        self.client_idle_timeout = timeout;
        self
    }

    /// Sets the backend read timeout.
    #[must_use]
    pub fn with_backend_read_timeout(mut self, timeout: Duration) -> Self {
        self.backend_read_timeout = timeout;
        self
    }

    /// Sets the minimum interval between topology reloads.
    #[must_use]
    pub fn with_slot_reload_interval(mut self, interval: Duration) -> Self {
        self.slot_reload_interval = interval;
        self
    }

    /// Sets the number of connections per backend.
    #[must_use]
    pub fn with_backend_connections(mut self, connections: usize) -> Self {
        self.backend_connections = connections;
        self
    }

    /// Sets the per-backend input queue capacity.
    #[must_use]
    pub fn with_backend_queue_size(mut self, size: usize) -> Self {
        self.backend_queue_size = size;
        self
    }

    /// Sets the per-connection pipeline depth.
    #[must_use]
    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth;
        self
    }

    /// Sets the redirect limit.
    #[must_use]
    pub fn with_redirect_limit(mut self, limit: u8) -> Self {
        self.redirect_limit = limit;
        self
    }

    /// Validates the configuration against system limits.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid knob.
    pub fn validate(&self) -> ProxyResult<()> {
        let limits = Limits::new();

        if self.startup_nodes.is_empty() {
            return Err(ProxyError::Config {
                name: "startup_nodes",
                reason: "must name at least one node",
            });
        }
        if self.backend_connections == 0 {
            return Err(ProxyError::Config {
                name: "backend_connections",
                reason: "must be positive",
            });
        }
        if self.backend_connections > limits.max_backend_connections {
            return Err(ProxyError::Config {
                name: "backend_connections",
                reason: "exceeds the system limit",
            });
        }
        if self.dispatch_queue_size == 0 || self.dispatch_queue_size > limits.max_dispatch_queue {
            return Err(ProxyError::Config {
                name: "dispatch_queue_size",
                reason: "must be positive and within the system limit",
            });
        }
        if self.backend_queue_size == 0 || self.backend_queue_size > limits.max_backend_queue {
            return Err(ProxyError::Config {
                name: "backend_queue_size",
                reason: "must be positive and within the system limit",
            });
        }
        if self.session_channel_size == 0 || self.session_channel_size > limits.max_session_channel
        {
            return Err(ProxyError::Config {
                name: "session_channel_size",
                reason: "must be positive and within the system limit",
            });
        }
        if self.pipeline_depth == 0 || self.pipeline_depth > limits.max_pipeline_depth {
            return Err(ProxyError::Config {
                name: "pipeline_depth",
                reason: "must be positive and within the system limit",
            });
        }
        if self.redirect_limit > limits.max_redirects {
            return Err(ProxyError::Config {
                name: "redirect_limit",
                reason: "exceeds the system limit",
            });
        }
        Ok(())
    }
}
