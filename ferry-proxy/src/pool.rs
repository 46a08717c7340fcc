//! Backend connection pool.
//!
//! Caches idle TCP connections per backend address. Per-address pools are
//! created lazily; the map lock covers only lookup and insertion, never a
//! dial, so a slow backend cannot stall `get` for unrelated addresses.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Dials backend connections. The seam between the pool and the network,
/// replaceable in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establishes one connection to `addr` within `dial_timeout`.
    async fn connect(&self, addr: &str, dial_timeout: Duration) -> io::Result<TcpStream>;
}

/// The production connector: resolve, dial with timeout, disable Nagle.
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str, dial_timeout: Duration) -> io::Result<TcpStream> {
        // Resolve at connect time to support hostnames.
        let connect_future = async {
            let mut addrs = tokio::net::lookup_host(addr).await?;
            let resolved = addrs.next().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses found for {addr}"),
                )
            })?;
            TcpStream::connect(resolved).await
        };

        match tokio::time::timeout(dial_timeout, connect_future).await {
            Ok(Ok(stream)) => {
                // Disable Nagle's algorithm for lower latency.
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial to {addr} timed out"),
            )),
        }
    }
}

/// Idle connections for one backend address.
struct AddrPool {
    idle: Mutex<Vec<TcpStream>>,
}

/// Shared pool of idle backend connections, keyed by address.
#[derive(Clone)]
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    pools: Mutex<HashMap<Arc<str>, Arc<AddrPool>>>,
    max_idle: usize,
    dial_timeout: Duration,
    connector: Arc<dyn Connector>,
}

impl ConnPool {
    /// Creates a pool using the production TCP connector.
    #[must_use]
    pub fn new(max_idle: usize, dial_timeout: Duration) -> Self {
        Self::with_connector(max_idle, dial_timeout, Arc::new(TcpConnector))
    }

    /// Creates a pool with a custom connector.
    #[must_use]
    pub fn with_connector(
        max_idle: usize,
        dial_timeout: Duration,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                pools: Mutex::new(HashMap::new()),
                max_idle,
                dial_timeout,
                connector,
            }),
        }
    }

    /// Hands out a connection to `addr`: an idle one if available, otherwise
    /// freshly dialed.
    ///
    /// # Errors
    ///
    /// Returns the dial error if no idle connection exists and dialing fails.
    pub async fn get(&self, addr: &Arc<str>) -> io::Result<TcpStream> {
        let pool = {
            let mut pools = self.inner.pools.lock().await;
            Arc::clone(
                pools
                    .entry(Arc::clone(addr))
                    .or_insert_with(|| Arc::new(AddrPool {
                        idle: Mutex::new(Vec::new()),
                    })),
            )
        };

        if let Some(conn) = pool.idle.lock().await.pop() {
            debug!(addr = %addr, "reusing idle backend connection");
            return Ok(conn);
        }

        self.inner
            .connector
            .connect(addr, self.inner.dial_timeout)
            .await
    }

    /// Returns a connection to the pool.
    ///
    /// If the address was removed or the idle pool is full, the connection is
    /// dropped instead.
    pub async fn release(&self, addr: &str, conn: TcpStream) {
        let pool = {
            let pools = self.inner.pools.lock().await;
            pools.get(addr).cloned()
        };
        let Some(pool) = pool else {
            return;
        };
        let mut idle = pool.idle.lock().await;
        if idle.len() < self.inner.max_idle {
            idle.push(conn);
        }
    }

    /// Drops the per-address pool and all its idle connections.
    ///
    /// Connections already handed out are unaffected; their eventual release
    /// finds no pool and drops them.
    pub async fn remove(&self, addr: &str) {
        let removed = self.inner.pools.lock().await.remove(addr);
        if removed.is_some() {
            debug!(addr = %addr, "removed backend connection pool");
        }
    }
}
