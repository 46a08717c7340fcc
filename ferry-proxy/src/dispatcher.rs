//! The dispatcher - routes every request to the right task runner.
//!
//! A single event loop consumes the central request channel fed by all
//! sessions, resolves each request's slot to a backend address, and forwards
//! it to that backend's task runner, creating runners lazily and retiring
//! them on topology changes. A companion reload loop refreshes the slot
//! table from the startup nodes, throttled by a coalescing signal so a burst
//! of redirections costs at most one topology query per interval.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backend::TaskRunner;
use crate::config::ProxyConfig;
use crate::error::ProxyResult;
use crate::pool::ConnPool;
use crate::request::{PipelineRequest, SlotInfo, SlotUpdate};
use crate::slot_table::SlotTable;
use crate::topology;

/// Consecutive reload failures tolerated before the process is aborted.
const RELOAD_FAILURE_LIMIT: u32 = 3;

/// Cloneable handle for feeding the dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    req_tx: mpsc::Sender<PipelineRequest>,
    update_tx: mpsc::Sender<SlotUpdate>,
    reload_tx: mpsc::Sender<()>,
}

impl DispatcherHandle {
    /// Submits a request for routing.
    ///
    /// Blocks when the central queue is full, propagating backpressure to
    /// the submitting session's TCP stream.
    pub async fn schedule(&self, req: PipelineRequest) {
        if let Err(mpsc::error::SendError(req)) = self.req_tx.send(req).await {
            req.respond(Err(crate::error::ProxyError::Shutdown)).await;
        }
    }

    /// Pushes a single-range ownership change, for control-plane
    /// integrations.
    pub async fn update_slot_info(&self, info: SlotInfo) {
        let _ = self.update_tx.send(SlotUpdate::Single(info)).await;
    }

    /// Requests a topology reload.
    ///
    /// Inherently throttled: concurrent callers collapse into at most one
    /// pending reload, and the reload loop enforces the minimum interval.
    pub fn trigger_reload_slots(&self) {
        let _ = self.reload_tx.try_send(());
    }
}

/// The routing event loop and its state.
pub struct Dispatcher {
    config: Arc<ProxyConfig>,
    pool: ConnPool,
    slot_table: Arc<SlotTable>,
    runners: HashMap<Arc<str>, TaskRunner>,
    req_rx: mpsc::Receiver<PipelineRequest>,
    update_rx: mpsc::Receiver<SlotUpdate>,
    reload_rx: Option<mpsc::Receiver<()>>,
    update_tx: Option<mpsc::Sender<SlotUpdate>>,
}

impl Dispatcher {
    /// Creates the dispatcher and the handle used to feed it.
    ///
    /// The dispatcher itself holds no handle: once every returned handle
    /// clone is dropped, the request channel closes and [`run`](Self::run)
    /// winds down.
    #[must_use]
    pub fn new(config: Arc<ProxyConfig>, pool: ConnPool) -> (Self, DispatcherHandle) {
        let (req_tx, req_rx) = mpsc::channel(config.dispatch_queue_size);
        let (update_tx, update_rx) = mpsc::channel(64);
        // The coalescing reload signal: capacity 1, non-blocking sends.
        let (reload_tx, reload_rx) = mpsc::channel(1);

        let handle = DispatcherHandle {
            req_tx,
            update_tx: update_tx.clone(),
            reload_tx,
        };
        let dispatcher = Self {
            config,
            pool,
            slot_table: Arc::new(SlotTable::new()),
            runners: HashMap::new(),
            req_rx,
            update_rx,
            reload_rx: Some(reload_rx),
            update_tx: Some(update_tx),
        };
        (dispatcher, handle)
    }

    /// Returns the shared slot table.
    #[must_use]
    pub fn slot_table(&self) -> Arc<SlotTable> {
        Arc::clone(&self.slot_table)
    }

    /// Populates the slot table from the startup nodes.
    ///
    /// Must succeed before the proxy starts accepting clients.
    ///
    /// # Errors
    ///
    /// Returns an error when every startup node fails the topology query.
    pub async fn init_slot_table(&self) -> ProxyResult<()> {
        let infos = topology::fetch_slot_table(
            &self.pool,
            &self.config.startup_nodes,
            self.config.backend_read_timeout,
        )
        .await?;
        self.slot_table.set_bulk(&infos).await;
        info!(
            ranges = infos.len(),
            covered = self.slot_table.covered().await,
            "slot table initialized"
        );
        Ok(())
    }

    /// Runs the event loop until every handle is dropped.
    ///
    /// Dropping the last [`DispatcherHandle`] closes the request channel;
    /// the loop drains, retires its runners, and returns.
    pub async fn run(mut self) {
        let (Some(reload_rx), Some(update_tx)) = (self.reload_rx.take(), self.update_tx.take())
        else {
            return;
        };
        tokio::spawn(reload_loop(
            reload_rx,
            self.pool.clone(),
            update_tx,
            Arc::clone(&self.config),
        ));

        loop {
            tokio::select! {
                req = self.req_rx.recv() => match req {
                    Some(req) => self.dispatch(req).await,
                    None => break,
                },
                update = self.update_rx.recv() => match update {
                    Some(update) => self.apply_update(update).await,
                    None => break,
                },
            }
        }

        info!("dispatch loop exiting");
        for runner in self.runners.values_mut() {
            runner.exit();
        }
    }

    /// Routes one request to its backend's task runner.
    async fn dispatch(&mut self, req: PipelineRequest) {
        let target = match &req.redirect_to {
            Some(addr) => Arc::clone(addr),
            None => match self.slot_table.get(req.slot).await {
                Some(addr) => addr,
                None => {
                    // The table is fully populated at boot; losing an owner
                    // means the control plane handed us a broken topology.
                    fatal(&format!("no owner for slot {}", req.slot));
                }
            },
        };

        let runner = self.runners.entry(Arc::clone(&target)).or_insert_with(|| {
            info!(addr = %target, "creating task runner");
            TaskRunner::new(
                Arc::clone(&target),
                self.pool.clone(),
                Arc::clone(&self.config),
            )
        });
        runner.enqueue(req).await;
    }

    /// Applies a topology change, retiring runners that lost all slots.
    async fn apply_update(&mut self, update: SlotUpdate) {
        match update {
            SlotUpdate::Single(info) => {
                info!(
                    start = info.start.get(),
                    end = info.end.get(),
                    master = %info.master,
                    "slot range reassigned"
                );
                self.slot_table.set(&info).await;
            }
            SlotUpdate::Bulk(infos) => {
                let masters: HashSet<Arc<str>> =
                    infos.iter().map(|info| Arc::clone(&info.master)).collect();
                self.slot_table.set_bulk(&infos).await;
                debug!(ranges = infos.len(), "bulk slot update applied");

                self.runners.retain(|addr, runner| {
                    if masters.contains(addr) {
                        true
                    } else {
                        info!(addr = %addr, "retiring task runner for removed backend");
                        runner.exit();
                        false
                    }
                });
            }
        }
    }
}

/// Waits out the reload interval, then blocks for the coalesced signal and
/// refreshes the topology. The interval wait is the throttle.
async fn reload_loop(
    mut reload_rx: mpsc::Receiver<()>,
    pool: ConnPool,
    update_tx: mpsc::Sender<SlotUpdate>,
    config: Arc<ProxyConfig>,
) {
    let mut fails: u32 = 0;
    loop {
        tokio::time::sleep(config.slot_reload_interval).await;
        if reload_rx.recv().await.is_none() {
            debug!("exit slot reload loop");
            return;
        }

        warn!("reloading slot table");
        match topology::fetch_slot_table(
            &pool,
            &config.startup_nodes,
            config.backend_read_timeout,
        )
        .await
        {
            Ok(infos) => {
                fails = 0;
                if update_tx.send(SlotUpdate::Bulk(infos)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                fails += 1;
                error!(error = %err, consecutive = fails, "slot table reload failed");
                if fails > RELOAD_FAILURE_LIMIT {
                    // Operating on a drifted slot table guarantees an
                    // unbounded cascade of redirections.
                    fatal("slot table reload failed repeatedly");
                }
            }
        }
    }
}

/// Unrecoverable control-plane failure.
fn fatal(message: &str) -> ! {
    error!("{message}; aborting");
    std::process::exit(1);
}
