//! System limits and configuration bounds.
//!
//! Every queue, buffer, and pipeline in the proxy has an explicit maximum.
//! Configuration is validated against these caps at startup so a bad flag
//! fails fast instead of exhausting memory at 3am.

/// Upper bounds for configurable resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum size of the dispatcher request queue.
    pub max_dispatch_queue: usize,
    /// Maximum size of a per-backend request queue.
    pub max_backend_queue: usize,
    /// Maximum size of a per-session response channel.
    pub max_session_channel: usize,
    /// Maximum pipeline depth (unanswered requests) per backend connection.
    pub max_pipeline_depth: usize,
    /// Maximum backend connections per address.
    pub max_backend_connections: usize,
    /// Maximum redirections followed before the reply is surfaced verbatim.
    pub max_redirects: u8,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_dispatch_queue: 1 << 20,
            max_backend_queue: 1 << 18,
            max_session_channel: 1 << 16,
            max_pipeline_depth: 4096,
            max_backend_connections: 256,
            max_redirects: 16,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}
