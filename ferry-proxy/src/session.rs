//! Per-client session: the protocol front half of the proxy.
//!
//! Each accepted connection gets a reader and a writer task. The reader
//! decodes pipelined commands, assigns each a slot and a per-session
//! sequence number, and submits it to the dispatcher. The writer drains the
//! session's response channel and emits replies strictly in submission
//! order: requests from one client may complete on different backends in any
//! order, so a reorder buffer keyed by sequence number restores the order
//! the client expects.
//!
//! Redirection replies are intercepted in the writer: within the redirect
//! limit the request is re-dispatched to the named backend (with an ASKING
//! prefix for ask-redirects) and a topology reload is triggered; past the
//! limit the redirection is surfaced to the client verbatim.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use ferry_core::{key_slot, Slot};
use ferry_resp::{decode_command, encode_value, Command, RedirectKind, Redirection, RespValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::dispatcher::DispatcherHandle;
use crate::multi_op;
use crate::request::{PipelineRequest, PipelineResponse};

/// Serves one client connection to completion.
///
/// Returns once the client is gone and every admitted request has resolved.
pub async fn run(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: DispatcherHandle,
    config: Arc<ProxyConfig>,
) {
    let (read_half, write_half) = stream.into_split();
    let (back_tx, back_rx) = mpsc::channel(config.session_channel_size);
    let (close_tx, _) = watch::channel(false);
    let close = Arc::new(close_tx);

    let writer = tokio::spawn(writer_loop(
        write_half,
        back_rx,
        dispatcher.clone(),
        Arc::clone(&close),
        Arc::clone(&config),
        peer,
    ));

    reader_loop(
        read_half,
        back_tx,
        &dispatcher,
        close.subscribe(),
        &config,
        peer,
    )
    .await;

    // The writer exits once every in-flight request has resolved: the
    // response channel closes when the reader's sender (dropped above) and
    // every clone held by outstanding requests are gone.
    let _ = writer.await;
    debug!(peer = %peer, "session closed");
}

/// Decodes commands and submits them to the dispatcher.
async fn reader_loop(
    mut read_half: OwnedReadHalf,
    back_tx: mpsc::Sender<PipelineResponse>,
    dispatcher: &DispatcherHandle,
    mut close_rx: watch::Receiver<bool>,
    config: &Arc<ProxyConfig>,
    peer: SocketAddr,
) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut seq: u64 = 0;

    loop {
        let command = match decode_command(&mut buf) {
            Ok(Some(command)) => command,
            Ok(None) => {
                let read = tokio::select! {
                    _ = close_rx.changed() => break,
                    read = tokio::time::timeout(
                        config.client_idle_timeout,
                        read_half.read_buf(&mut buf),
                    ) => read,
                };
                match read {
                    Ok(Ok(0)) => {
                        debug!(peer = %peer, "client closed connection");
                        break;
                    }
                    Ok(Ok(_)) => continue,
                    Ok(Err(err)) => {
                        debug!(peer = %peer, error = %err, "client read failed");
                        break;
                    }
                    Err(_) => {
                        info!(peer = %peer, "closing idle client");
                        break;
                    }
                }
            }
            Err(err) => {
                warn!(peer = %peer, error = %err, "client protocol error, closing session");
                break;
            }
        };

        seq += 1;
        submit(command, seq, &back_tx, dispatcher).await;
    }
}

/// Routes one decoded command: answered locally, fanned out by the
/// multi-key operator, or submitted as a single pipeline request.
async fn submit(
    command: Command,
    seq: u64,
    back_tx: &mpsc::Sender<PipelineResponse>,
    dispatcher: &DispatcherHandle,
) {
    // PING never touches a backend.
    if command.name() == "PING" && command.args().len() == 1 {
        let req = PipelineRequest::new(command.into_raw(), Slot::new(0), seq, back_tx.clone());
        req.respond(Ok(RespValue::simple("PONG"))).await;
        return;
    }

    if let Some(keys) = command.multi_keys() {
        let slots: Vec<Slot> = keys.iter().map(|key| key_slot(key)).collect();
        if slots.windows(2).any(|pair| pair[0] != pair[1]) {
            multi_op::handle(command, seq, back_tx.clone(), dispatcher.clone());
            return;
        }
        let req = PipelineRequest::new(command.into_raw(), slots[0], seq, back_tx.clone());
        dispatcher.schedule(req).await;
        return;
    }

    // Keyless commands (e.g. COMMAND, INFO) ride on slot 0's owner.
    let slot = command.key().map_or_else(|| Slot::new(0), key_slot);
    let req = PipelineRequest::new(command.into_raw(), slot, seq, back_tx.clone());
    dispatcher.schedule(req).await;
}

/// Drains the response channel and writes replies in submission order.
async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut back_rx: mpsc::Receiver<PipelineResponse>,
    dispatcher: DispatcherHandle,
    close: Arc<watch::Sender<bool>>,
    config: Arc<ProxyConfig>,
    peer: SocketAddr,
) {
    let mut reorder = ReorderBuffer::new();
    let mut out = BytesMut::with_capacity(16 * 1024);

    while let Some(resp) = back_rx.recv().await {
        let Some(resp) = follow_redirect(resp, &dispatcher, config.redirect_limit).await else {
            continue;
        };

        reorder.insert(resp.req.seq, resp);
        out.clear();
        while let Some(ready) = reorder.pop_next() {
            render(&ready, &mut out);
        }
        if out.is_empty() {
            continue;
        }
        if let Err(err) = write_half.write_all(&out).await {
            debug!(peer = %peer, error = %err, "client write failed");
            // Stop the reader; responses still in flight drain into the
            // closed channel and are dropped with the session.
            let _ = close.send(true);
            break;
        }
    }
    let _ = close.send(true);
}

/// Re-dispatches a redirected request, or returns the response for the
/// client when it is not a redirection (or the limit is reached).
async fn follow_redirect(
    resp: PipelineResponse,
    dispatcher: &DispatcherHandle,
    redirect_limit: u8,
) -> Option<PipelineResponse> {
    let redirect = match &resp.payload {
        Ok(value) => Redirection::parse(value),
        Err(_) => None,
    };
    let Some(redirect) = redirect else {
        return Some(resp);
    };

    if resp.req.redirect_count >= redirect_limit {
        debug!(
            slot = redirect.slot,
            addr = %redirect.addr,
            "redirect limit reached, surfacing reply"
        );
        return Some(resp);
    }

    let mut req = resp.req;
    req.redirect_count += 1;
    req.asking = redirect.kind == RedirectKind::Ask;
    req.redirect_to = Some(Arc::from(redirect.addr.as_str()));

    debug!(
        slot = redirect.slot,
        addr = %redirect.addr,
        kind = ?redirect.kind,
        attempt = req.redirect_count,
        "following redirection"
    );
    dispatcher.trigger_reload_slots();
    dispatcher.schedule(req).await;
    None
}

/// Encodes one response; failures become protocol error replies.
fn render(resp: &PipelineResponse, out: &mut BytesMut) {
    match &resp.payload {
        Ok(value) => encode_value(value, out),
        Err(err) => encode_value(&RespValue::error(err.to_string()), out),
    }
}

/// Holds out-of-order responses until their turn to be written.
struct ReorderBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> ReorderBuffer<T> {
    /// Sequence numbers start at 1.
    fn new() -> Self {
        Self {
            next: 1,
            pending: BTreeMap::new(),
        }
    }

    fn insert(&mut self, seq: u64, item: T) {
        self.pending.insert(seq, item);
    }

    /// Pops the next in-order item, if it has arrived.
    fn pop_next(&mut self) -> Option<T> {
        let item = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }
}
