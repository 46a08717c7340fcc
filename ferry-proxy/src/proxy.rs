//! The front door: TCP accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::config::ProxyConfig;
use crate::dispatcher::DispatcherHandle;
use crate::error::ProxyResult;
use crate::session;

/// Accepts client connections and spawns a session per connection.
pub struct Proxy {
    config: Arc<ProxyConfig>,
    dispatcher: DispatcherHandle,
    shutdown: Arc<Notify>,
}

impl Proxy {
    /// Creates the proxy front end.
    #[must_use]
    pub fn new(config: Arc<ProxyConfig>, dispatcher: DispatcherHandle) -> Self {
        Self {
            config,
            dispatcher,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Returns a handle used to signal shutdown.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be bound.
    pub fn bind(&self) -> ProxyResult<TcpListener> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = create_reusable_listener(addr)?;
        info!(addr = %addr, "proxy listening");
        Ok(listener)
    }

    /// Binds and serves until shutdown is signaled.
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be bound.
    pub async fn run(&self) -> ProxyResult<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Serves an already-bound listener until shutdown is signaled.
    ///
    /// # Errors
    ///
    /// Currently infallible after binding; kept fallible for parity with
    /// [`run`](Self::run).
    pub async fn serve(&self, listener: TcpListener) -> ProxyResult<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(peer = %peer, "accepted client");
                        let _ = stream.set_nodelay(true);
                        let dispatcher = self.dispatcher.clone();
                        let config = Arc::clone(&self.config);
                        tokio::spawn(session::run(stream, peer, dispatcher, config));
                    }
                    Err(err) => {
                        error!(error = %err, "failed to accept connection");
                    }
                },
                () = self.shutdown.notified() => {
                    info!("proxy shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Create a TCP listener with `SO_REUSEADDR` enabled.
///
/// This allows the proxy to bind to a port that is in `TIME_WAIT` state,
/// which is essential for fast restarts.
fn create_reusable_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}
