//! Event-driven transport: one tokio event loop thread multiplexes every
//! connection, reads and writes resume on socket readiness.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Handle};
use tokio::sync::{mpsc, oneshot};

use super::{ConnectionHandler, ConnectionWriter, DisconnectGuard, Transport};
use crate::error::{PeerError, PeerResult};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Hands bytes to the connection task; never blocks the caller.
struct NioWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Separate from `tx` so a close overtakes queued and in-flight writes.
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
    closed: AtomicBool,
}

impl ConnectionWriter for NioWriter {
    fn write(&self, bytes: &[u8]) -> PeerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PeerError::ConnectionClosed);
        }
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| PeerError::Disconnected)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(close_tx) = self.close_tx.lock().take() {
            // The task may already be gone.
            let _ = close_tx.send(());
        }
    }
}

pub struct NioTransport {
    handle: Handle,
    shut_down: AtomicBool,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl NioTransport {
    /// Starts the event loop thread.
    pub fn new() -> PeerResult<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let event_loop = thread::Builder::new()
            .name("nio-event-loop".to_owned())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
                // Dropping the runtime drops every connection task, and with
                // it each task's DisconnectGuard.
                drop(runtime);
                tracing::debug!("Event loop stopped");
            })?;

        Ok(Self {
            handle,
            shut_down: AtomicBool::new(false),
            stop: Mutex::new(Some(stop_tx)),
            event_loop: Mutex::new(Some(event_loop)),
        })
    }
}

async fn run_connection(addr: SocketAddr, timeout: Duration, guard: DisconnectGuard) {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::debug!(addr = %addr, error = %e, "Connect failed");
            return;
        }
        Err(_) => {
            tracing::debug!(addr = %addr, "Connect timed out");
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
    }

    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (close_tx, mut close_rx) = oneshot::channel::<()>();
    guard.handler().on_connected(Arc::new(NioWriter {
        tx,
        close_tx: Mutex::new(Some(close_tx)),
        closed: AtomicBool::new(false),
    }));
    tracing::debug!(addr = %addr, "TCP connection established");

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = &mut close_rx => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!(addr = %addr, "Connection closed by remote");
                    break;
                }
                Ok(n) => guard.handler().on_bytes(&buf[..n]),
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "Socket read failed");
                    break;
                }
            },
            bytes = rx.recv() => {
                let Some(bytes) = bytes else { break };
                // A remote that stops reading must not hold off a close.
                tokio::select! {
                    _ = &mut close_rx => break,
                    written = writer.write_all(&bytes) => {
                        if let Err(e) = written {
                            tracing::debug!(addr = %addr, error = %e, "Socket write failed");
                            break;
                        }
                    }
                }
            }
        }
    }
    // Dropping both halves closes the socket; no flush of unsent bytes.
    drop(writer);
    drop(reader);
}

impl Transport for NioTransport {
    fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        handler: Arc<dyn ConnectionHandler>,
    ) -> PeerResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(PeerError::Transport("transport shut down".to_owned()));
        }
        // Built outside the task so it fires even if the task never runs.
        let guard = DisconnectGuard::new(handler);
        self.handle.spawn(run_connection(addr, timeout, guard));
        Ok(())
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
        let event_loop = self.event_loop.lock().take();
        if let Some(event_loop) = event_loop {
            // Joining from the loop itself would deadlock.
            if event_loop.thread().id() != thread::current().id() && event_loop.join().is_err() {
                tracing::warn!("Event loop thread panicked");
            }
        }
    }
}

impl Drop for NioTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
