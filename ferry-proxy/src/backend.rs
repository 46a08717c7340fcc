//! Per-backend task runner and its pipelined backend sessions.
//!
//! A `TaskRunner` supervises one backend address: it owns a bounded input
//! queue shared by N backend sessions, each a writer/reader pair over one
//! persistent TCP connection. The writer pipelines request frames onto the
//! socket and pushes each request onto a bounded in-flight queue; the reader
//! pops that queue in order and matches one decoded reply per entry. FIFO
//! discipline per socket is what makes multiplexing safe.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use ferry_resp::{asking_frame, decode_value, RespValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::pool::ConnPool;
use crate::request::PipelineRequest;

/// Initial delay before re-dialing a backend that refused a connection.
const RECONNECT_DELAY_MIN: Duration = Duration::from_millis(100);

/// Ceiling for the reconnect backoff.
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(10);

/// The input queue, shared by all backend sessions of one runner.
type SharedQueue = Arc<Mutex<mpsc::Receiver<PipelineRequest>>>;

/// Supervisor for one backend address.
pub struct TaskRunner {
    addr: Arc<str>,
    in_tx: Option<mpsc::Sender<PipelineRequest>>,
    exit: Arc<Notify>,
}

impl TaskRunner {
    /// Creates the runner and starts its control loop.
    ///
    /// Dialing happens asynchronously; dial failures surface per-request as
    /// `BackendUnreachable` replies rather than failing construction.
    #[must_use]
    pub fn new(addr: Arc<str>, pool: ConnPool, config: Arc<ProxyConfig>) -> Self {
        let (in_tx, in_rx) = mpsc::channel(config.backend_queue_size);
        let exit = Arc::new(Notify::new());

        let control = ControlLoop {
            addr: Arc::clone(&addr),
            pool,
            config,
            queue: Arc::new(Mutex::new(in_rx)),
            exit: Arc::clone(&exit),
        };
        tokio::spawn(control.run());

        Self {
            addr,
            in_tx: Some(in_tx),
            exit,
        }
    }

    /// Hands a request to this backend.
    ///
    /// Never blocks: a full queue fails the request immediately with
    /// `QueueOverflow` through its back channel. This is the only
    /// backpressure signal surfaced to the client.
    pub async fn enqueue(&self, req: PipelineRequest) {
        let Some(in_tx) = &self.in_tx else {
            let addr = Arc::clone(&self.addr);
            req.respond(Err(ProxyError::Dispatch { addr })).await;
            return;
        };
        match in_tx.try_send(req) {
            Ok(()) => {}
            Err(TrySendError::Full(req)) => {
                warn!(addr = %self.addr, "backend queue overflow");
                let addr = Arc::clone(&self.addr);
                req.respond(Err(ProxyError::QueueOverflow { addr })).await;
            }
            Err(TrySendError::Closed(req)) => {
                let addr = Arc::clone(&self.addr);
                req.respond(Err(ProxyError::Dispatch { addr })).await;
            }
        }
    }

    /// Closes the input queue and stops the control loop.
    ///
    /// The queue is closed exactly once, here; requests already admitted
    /// drain naturally through the remaining backend sessions.
    pub fn exit(&mut self) {
        if self.in_tx.take().is_some() {
            info!(addr = %self.addr, "task runner exiting");
            self.exit.notify_one();
        }
    }
}

/// Keeps the runner's backend session quota filled.
struct ControlLoop {
    addr: Arc<str>,
    pool: ConnPool,
    config: Arc<ProxyConfig>,
    queue: SharedQueue,
    exit: Arc<Notify>,
}

impl ControlLoop {
    async fn run(self) {
        let permits = Arc::new(Semaphore::new(self.config.backend_connections));
        let mut reconnect_delay = RECONNECT_DELAY_MIN;

        loop {
            let permit = tokio::select! {
                () = self.exit.notified() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.pool.get(&self.addr).await {
                Ok(conn) => {
                    reconnect_delay = RECONNECT_DELAY_MIN;
                    let session = BackendSession {
                        addr: Arc::clone(&self.addr),
                        queue: Arc::clone(&self.queue),
                        read_timeout: self.config.backend_read_timeout,
                        pipeline_depth: self.config.pipeline_depth,
                    };
                    tokio::spawn(session.run(conn, permit, self.pool.clone()));
                }
                Err(err) => {
                    // Backend is down: clear pending requests so sessions do
                    // not back up the dispatcher, then retry after a delay.
                    warn!(addr = %self.addr, error = %err, "connect to backend failed, clearing pending requests");
                    self.drain_queue(&err).await;
                    drop(permit);

                    tokio::select! {
                        () = self.exit.notified() => break,
                        () = tokio::time::sleep(reconnect_delay) => {}
                    }
                    reconnect_delay = (reconnect_delay * 2).min(RECONNECT_DELAY_MAX);
                }
            }
        }
        debug!(addr = %self.addr, "task runner control loop exited");
    }

    /// Fails everything currently queued with the dial error, non-blocking.
    async fn drain_queue(&self, err: &std::io::Error) {
        let mut queue = self.queue.lock().await;
        while let Ok(req) = queue.try_recv() {
            req.respond(Err(ProxyError::unreachable(&self.addr, err.to_string())))
                .await;
        }
    }
}

/// One pipelined connection to a backend.
struct BackendSession {
    addr: Arc<str>,
    queue: SharedQueue,
    read_timeout: Duration,
    pipeline_depth: usize,
}

impl BackendSession {
    async fn run(self, conn: TcpStream, permit: OwnedSemaphorePermit, pool: ConnPool) {
        debug!(addr = %self.addr, "backend session started");
        let (read_half, write_half) = conn.into_split();
        let (fifo_tx, fifo_rx) = mpsc::channel(self.pipeline_depth);
        let (close_tx, _) = watch::channel(false);
        let close = Arc::new(close_tx);

        let writer = writer_loop(
            &self.addr,
            write_half,
            &self.queue,
            fifo_tx,
            &close,
            close.subscribe(),
        );
        let reader = reader_loop(
            &self.addr,
            read_half,
            fifo_rx,
            self.read_timeout,
            &close,
            close.subscribe(),
        );
        let ((write_half, writer_clean), (read_half, reader_clean)) =
            tokio::join!(writer, reader);

        // Clean shutdown returns the connection to the pool; any error path
        // discards it.
        if writer_clean && reader_clean {
            if let Ok(conn) = read_half.reunite(write_half) {
                pool.release(&self.addr, conn).await;
            }
        }
        debug!(addr = %self.addr, clean = writer_clean && reader_clean, "backend session ended");
        drop(permit);
    }
}

/// Pulls requests off the shared queue, writes them to the socket, and
/// pushes them onto the in-flight queue for the reader to match.
async fn writer_loop(
    addr: &Arc<str>,
    mut write_half: OwnedWriteHalf,
    queue: &SharedQueue,
    fifo_tx: mpsc::Sender<PipelineRequest>,
    close: &watch::Sender<bool>,
    mut close_rx: watch::Receiver<bool>,
) -> (OwnedWriteHalf, bool) {
    let mut clean = true;
    loop {
        let req = tokio::select! {
            _ = close_rx.changed() => {
                clean = false;
                break;
            }
            req = recv_shared(queue) => match req {
                Some(req) => req,
                // Queue closed by the runner's exit: wind down cleanly.
                None => break,
            },
        };

        let write_result = tokio::select! {
            _ = close_rx.changed() => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "backend session closed",
            )),
            result = write_request(&mut write_half, &req) => result,
        };

        if let Err(err) = write_result {
            warn!(addr = %addr, error = %err, "backend write failed");
            req.respond(Err(ProxyError::unreachable(addr, err.to_string())))
                .await;
            let _ = close.send(true);
            clean = false;
            break;
        }

        if let Err(mpsc::error::SendError(req)) = fifo_tx.send(req).await {
            // Reader is gone; the socket is no longer being matched.
            req.respond(Err(ProxyError::unreachable(addr, "backend session closed")))
                .await;
            clean = false;
            break;
        }
    }
    (write_half, clean)
}

/// Receives one request from the runner's shared input queue.
async fn recv_shared(queue: &SharedQueue) -> Option<PipelineRequest> {
    queue.lock().await.recv().await
}

/// Writes one request frame, preceded by the ASKING frame when the request
/// is an ask-redirect retry.
async fn write_request(
    write_half: &mut OwnedWriteHalf,
    req: &PipelineRequest,
) -> std::io::Result<()> {
    if req.asking {
        write_half.write_all(&asking_frame()).await?;
    }
    write_half.write_all(&req.raw).await?;
    write_half.flush().await
}

/// Matches one decoded reply per in-flight request, strictly in order.
async fn reader_loop(
    addr: &Arc<str>,
    mut read_half: OwnedReadHalf,
    mut fifo_rx: mpsc::Receiver<PipelineRequest>,
    read_timeout: Duration,
    close: &watch::Sender<bool>,
    mut close_rx: watch::Receiver<bool>,
) -> (OwnedReadHalf, bool) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut clean = true;

    loop {
        // Wait for the next in-flight request. The socket stays under watch
        // meanwhile: a backend closing an idle connection must tear the
        // session down now, not when the next request strands on it.
        let req = tokio::select! {
            req = fifo_rx.recv() => match req {
                Some(req) => req,
                // Writer wound down cleanly and nothing is in flight.
                None => break,
            },
            idle_read = read_half.read_buf(&mut buf) => match idle_read {
                // Reply bytes can land before the writer queues the request
                // it just wrote; keep them buffered and keep waiting.
                Ok(n) if n > 0 => continue,
                Ok(_) => {
                    fail_session(addr, "connection closed by backend", &mut fifo_rx, close).await;
                    clean = false;
                    break;
                }
                Err(err) => {
                    fail_session(addr, err.to_string(), &mut fifo_rx, close).await;
                    clean = false;
                    break;
                }
            },
        };

        // An ask-retry is preceded by the ASKING frame's own reply, which is
        // consumed and discarded on the same in-flight slot.
        let result = if req.asking {
            match read_reply(&mut read_half, &mut buf, read_timeout, &mut close_rx).await {
                Ok(_) => read_reply(&mut read_half, &mut buf, read_timeout, &mut close_rx).await,
                Err(reason) => Err(reason),
            }
        } else {
            read_reply(&mut read_half, &mut buf, read_timeout, &mut close_rx).await
        };

        match result {
            Ok(reply) => req.respond(Ok(reply)).await,
            Err(reason) => {
                warn!(addr = %addr, reason = %reason, "backend read failed");
                req.respond(Err(ProxyError::unreachable(addr, reason.clone())))
                    .await;
                fail_session(addr, reason, &mut fifo_rx, close).await;
                clean = false;
                break;
            }
        }
    }
    (read_half, clean)
}

/// Stops the writer and fails every request it already put in flight.
///
/// Draining recv until the writer drops its queue end guarantees a request
/// the writer is pushing right now still receives its failure reply.
async fn fail_session(
    addr: &Arc<str>,
    reason: impl Into<String>,
    fifo_rx: &mut mpsc::Receiver<PipelineRequest>,
    close: &watch::Sender<bool>,
) {
    let reason = reason.into();
    let _ = close.send(true);
    while let Some(req) = fifo_rx.recv().await {
        req.respond(Err(ProxyError::unreachable(addr, reason.clone())))
            .await;
    }
}

/// Reads one complete reply off the socket.
async fn read_reply(
    read_half: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    read_timeout: Duration,
    close_rx: &mut watch::Receiver<bool>,
) -> Result<RespValue, String> {
    loop {
        match decode_value(buf) {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(err) => return Err(err.to_string()),
        }

        let read = tokio::select! {
            _ = close_rx.changed() => return Err("backend session closed".to_string()),
            read = tokio::time::timeout(read_timeout, read_half.read_buf(buf)) => read,
        };
        match read {
            Ok(Ok(0)) => return Err("connection closed by backend".to_string()),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(err.to_string()),
            Err(_) => return Err(format!("no reply within {read_timeout:?}")),
        }
    }
}
