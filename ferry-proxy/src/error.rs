//! Proxy error types.

use std::sync::Arc;

use ferry_core::Slot;
use ferry_resp::RespError;

/// Errors produced by the routing and pipelining engine.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The backend's request queue is full; the request was rejected
    /// immediately instead of being silently dropped.
    #[error("backend queue overflow at {addr}")]
    QueueOverflow {
        /// The backend address.
        addr: Arc<str>,
    },

    /// The backend could not be dialed, written to, or read from.
    #[error("backend {addr} unreachable: {reason}")]
    BackendUnreachable {
        /// The backend address.
        addr: Arc<str>,
        /// What went wrong.
        reason: String,
    },

    /// The request could not be handed to a task runner.
    #[error("request could not be dispatched to {addr}")]
    Dispatch {
        /// The backend address.
        addr: Arc<str>,
    },

    /// No backend owns the slot. Impossible once the slot table is
    /// initialized from a full-coverage topology.
    #[error("no owner for slot {slot}")]
    SlotUnowned {
        /// The orphaned slot.
        slot: Slot,
    },

    /// Every startup node failed the topology query.
    #[error("all startup nodes failed the topology query")]
    AllNodesFailed,

    /// The topology reply did not have the expected shape.
    #[error("malformed topology reply: {message}")]
    Topology {
        /// What was malformed.
        message: String,
    },

    /// The proxy is shutting down.
    #[error("proxy is shutting down")]
    Shutdown,

    /// A wire protocol violation.
    #[error("protocol error: {0}")]
    Resp(#[from] RespError),

    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {name}: {reason}")]
    Config {
        /// The offending knob.
        name: &'static str,
        /// Why it is invalid.
        reason: &'static str,
    },
}

impl ProxyError {
    /// Builds a `BackendUnreachable` error.
    pub(crate) fn unreachable(addr: &Arc<str>, reason: impl Into<String>) -> Self {
        Self::BackendUnreachable {
            addr: Arc::clone(addr),
            reason: reason.into(),
        }
    }
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
