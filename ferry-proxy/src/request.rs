//! The units of work flowing through the proxy.
//!
//! A [`PipelineRequest`] is owned by the session that created it; the
//! dispatcher and task runner hold it only as a routing token, and a backend
//! session's in-flight queue owns it until the matching reply arrives. Every
//! admitted request produces exactly one [`PipelineResponse`] on its back
//! channel, success or failure.

use std::sync::Arc;

use bytes::Bytes;
use ferry_core::Slot;
use ferry_resp::RespValue;
use tokio::sync::mpsc;

use crate::error::ProxyResult;

/// Ownership of a contiguous, inclusive slot range.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    /// First slot of the range.
    pub start: Slot,
    /// Last slot of the range (inclusive).
    pub end: Slot,
    /// Address of the owning master.
    pub master: Arc<str>,
    /// Addresses of the replicas, if any.
    pub replicas: Vec<Arc<str>>,
}

impl SlotInfo {
    /// Creates a new slot range assignment.
    ///
    /// # Panics
    ///
    /// Panics if `start > end`.
    #[must_use]
    pub fn new(start: Slot, end: Slot, master: Arc<str>, replicas: Vec<Arc<str>>) -> Self {
        assert!(start <= end, "slot range start must be <= end");
        Self {
            start,
            end,
            master,
            replicas,
        }
    }
}

/// A topology change delivered to the dispatcher.
#[derive(Debug)]
pub enum SlotUpdate {
    /// A single range changed owner.
    Single(SlotInfo),
    /// A full topology refresh; runners for addresses absent from the new
    /// master set are retired.
    Bulk(Vec<SlotInfo>),
}

/// One admitted client request traveling through the core.
#[derive(Debug)]
pub struct PipelineRequest {
    /// The raw command frame, forwarded to the backend verbatim.
    pub raw: Bytes,
    /// The slot the routing key hashes to.
    pub slot: Slot,
    /// Per-session submission sequence number.
    pub seq: u64,
    /// The originating session's response channel.
    pub back: mpsc::Sender<PipelineResponse>,
    /// How many redirections this request has already followed.
    pub redirect_count: u8,
    /// Write a one-shot ASKING frame before this request.
    pub asking: bool,
    /// Route to this address instead of consulting the slot table.
    pub redirect_to: Option<Arc<str>>,
}

impl PipelineRequest {
    /// Creates a fresh request.
    #[must_use]
    pub fn new(raw: Bytes, slot: Slot, seq: u64, back: mpsc::Sender<PipelineResponse>) -> Self {
        Self {
            raw,
            slot,
            seq,
            back,
            redirect_count: 0,
            asking: false,
            redirect_to: None,
        }
    }

    /// Delivers the single response for this request on its back channel.
    ///
    /// Consuming `self` makes double delivery unrepresentable. A send failure
    /// means the session is gone; the response is dropped with it.
    pub async fn respond(self, payload: ProxyResult<RespValue>) {
        let back = self.back.clone();
        let _ = back.send(PipelineResponse { req: self, payload }).await;
    }
}

/// The single reply produced for an admitted request.
#[derive(Debug)]
pub struct PipelineResponse {
    /// The request this reply answers; rides along so the session can
    /// re-dispatch on redirection.
    pub req: PipelineRequest,
    /// The decoded backend reply, or the failure that took its place.
    pub payload: ProxyResult<RespValue>,
}
