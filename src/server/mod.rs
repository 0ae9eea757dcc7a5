//! Line-oriented TCP command server.
//!
//! Each accepted connection runs in its own task and sends commands to a
//! shared [`Store`]:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use raftkv::server::CommandServer;
//! use raftkv::store::Store;
//!
//! async fn serve(store: Arc<dyn Store>) -> raftkv::Result<()> {
//!     let server = CommandServer::new("127.0.0.1:3001", store).await?;
//!     server.run().await
//! }
//! ```

mod command;
mod connection;

pub use command::{Command, ProtocolError};
pub use connection::{ClientConnection, MAX_LINE_LENGTH, dispatch};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::store::Store;

/// Default ceiling on concurrently served clients.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Accepts client connections and serves the command protocol.
pub struct CommandServer {
    /// Taken by [`run`](Self::run) and dropped when it returns.
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    store: Arc<dyn Store>,
    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
    /// Maximum concurrently served clients (0 = unlimited)
    max_connections: usize,
}

impl CommandServer {
    /// Bind to `addr` with the default connection limit.
    ///
    /// Port 0 picks a free port; see [`local_addr`](Self::local_addr).
    pub async fn new(addr: &str, store: Arc<dyn Store>) -> Result<Self> {
        Self::with_config(addr, store, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Bind to `addr`, serving at most `max_connections` clients at once.
    ///
    /// Connections beyond the limit are closed as soon as they are accepted.
    /// A limit of 0 disables the check.
    pub async fn with_config(
        addr: &str,
        store: Arc<dyn Store>,
        max_connections: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        tracing::info!(
            addr = %local_addr,
            max_connections = max_connections,
            "Command server listening"
        );

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            store,
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
            max_connections,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Stop accepting connections and close the listening socket.
    /// Open connections are left to finish.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        // Not yet running: close the socket here.
        drop(self.take_listener());
        tracing::info!("Shutdown signal sent");
    }

    /// Stop accepting and wait up to `timeout` for open connections to close.
    ///
    /// Returns `true` if all connections drained in time.
    pub async fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();

        let start = std::time::Instant::now();
        let check_interval = Duration::from_millis(50);

        while start.elapsed() < timeout {
            let active = self.active_connections();
            if active == 0 {
                tracing::info!("All connections drained");
                return true;
            }
            tracing::debug!(active_connections = active, "Waiting for connections to drain");
            tokio::time::sleep(check_interval).await;
        }

        tracing::warn!(
            remaining_connections = self.active_connections(),
            "Shutdown timeout, connections still active"
        );
        false
    }

    fn take_listener(&self) -> Option<TcpListener> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called.
    ///
    /// The listening socket is closed when this returns. Returns immediately
    /// if the server was already shut down.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let Some(listener) = self.take_listener() else {
            tracing::debug!("Command server already stopped");
            return Ok(());
        };

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Command server shutting down, no longer accepting connections");
                    return Ok(());
                }
                accept_result = listener.accept() => {
                    let (stream, addr) = match accept_result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    if self.max_connections > 0 {
                        let current = self.active_connections.load(Ordering::SeqCst);
                        if current >= self.max_connections {
                            tracing::warn!(
                                client_addr = %addr,
                                current_connections = current,
                                max_connections = self.max_connections,
                                "Rejecting connection - limit exceeded"
                            );
                            drop(stream);
                            continue;
                        }
                    }
                    tracing::debug!(client_addr = %addr, "Accepted connection");

                    let store = self.store.clone();
                    let active_connections = self.active_connections.clone();
                    active_connections.fetch_add(1, Ordering::SeqCst);

                    tokio::spawn(async move {
                        let mut conn = ClientConnection::new(stream, addr);
                        if let Err(e) = conn.handle_requests(store).await {
                            tracing::warn!(client_addr = %addr, error = %e, "Connection closed with error");
                        }
                        active_connections.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }
    }
}
