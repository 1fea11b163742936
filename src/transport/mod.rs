//! Socket I/O behind one contract, with a blocking and an event-driven variant.
//!
//! The peer layer only sees [`Transport`], [`ConnectionHandler`] and
//! [`ConnectionWriter`]. Per connection, a transport guarantees:
//!
//! - `on_connected` at most once, before any `on_bytes`;
//! - `on_bytes` in arrival order, with arbitrary chunk boundaries;
//! - `on_disconnected` exactly once, whatever ended the connection
//!   (failed connect, EOF, reset, local close or transport shutdown).

pub mod blocking;
pub mod nio;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::PeerResult;

pub use blocking::BlockingTransport;
pub use nio::NioTransport;

/// Read callback registered with a connection when it is opened.
pub trait ConnectionHandler: Send + Sync {
    /// The socket is open; `writer` sends on it.
    fn on_connected(&self, writer: Arc<dyn ConnectionWriter>);

    fn on_bytes(&self, bytes: &[u8]);

    /// The connection is gone, for whatever reason.
    fn on_disconnected(&self);
}

/// Write side of an open connection.
pub trait ConnectionWriter: Send + Sync {
    /// Queues or writes `bytes`. Fails once the connection is closed.
    fn write(&self, bytes: &[u8]) -> PeerResult<()>;

    /// Closes the connection, unblocking any in-flight read or write. Idempotent.
    fn close(&self);
}

pub trait Transport: Send + Sync {
    /// Starts connecting to `addr` in the background and binds `handler` to
    /// the connection. Only fails if the attempt could not be started, in
    /// which case the caller must fail the connection itself.
    fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        handler: Arc<dyn ConnectionHandler>,
    ) -> PeerResult<()>;

    /// Closes every connection and refuses new ones.
    fn shutdown(&self);
}

/// Selects a transport implementation at pool construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// One thread per connection, blocking socket calls.
    Blocking,
    /// One event loop thread multiplexing every connection.
    NonBlocking,
}

impl TransportKind {
    pub fn build(self) -> PeerResult<Arc<dyn Transport>> {
        Ok(match self {
            TransportKind::Blocking => Arc::new(BlockingTransport::new()),
            TransportKind::NonBlocking => Arc::new(NioTransport::new()?),
        })
    }
}

/// Fires `on_disconnected` when dropped, so every exit path reports once.
pub(crate) struct DisconnectGuard {
    handler: Arc<dyn ConnectionHandler>,
}

impl DisconnectGuard {
    pub(crate) fn new(handler: Arc<dyn ConnectionHandler>) -> Self {
        Self { handler }
    }

    pub(crate) fn handler(&self) -> &dyn ConnectionHandler {
        &*self.handler
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.handler.on_disconnected();
    }
}
