//! Thread-per-connection transport over blocking std sockets.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::{ConnectionHandler, ConnectionWriter, DisconnectGuard, Transport};
use crate::error::{PeerError, PeerResult};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// A remote that reads nothing for this long is treated as gone.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Writes go straight to the socket on the caller's thread.
struct BlockingWriter {
    stream: Mutex<TcpStream>,
    /// Separate handle so `close` never waits behind a blocked write.
    control: TcpStream,
    closed: AtomicBool,
}

impl BlockingWriter {
    fn new(stream: &TcpStream) -> io::Result<Self> {
        Ok(Self {
            stream: Mutex::new(stream.try_clone()?),
            control: stream.try_clone()?,
            closed: AtomicBool::new(false),
        })
    }
}

impl ConnectionWriter for BlockingWriter {
    fn write(&self, bytes: &[u8]) -> PeerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PeerError::ConnectionClosed);
        }
        let mut stream = self.stream.lock();
        stream.write_all(bytes).map_err(|e| {
            tracing::debug!(error = %e, "Socket write failed");
            PeerError::Disconnected
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wakes the reader thread with EOF and fails any blocked write.
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            tracing::trace!(error = %e, "Socket shutdown failed");
        }
    }
}

#[derive(Default)]
pub struct BlockingTransport {
    shut_down: Arc<AtomicBool>,
    live: Arc<Mutex<Vec<Weak<BlockingWriter>>>>,
}

impl BlockingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections currently open.
    pub fn open_connections(&self) -> usize {
        self.live
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

fn run_connection(
    addr: SocketAddr,
    timeout: Duration,
    guard: DisconnectGuard,
    shut_down: Arc<AtomicBool>,
    live: Arc<Mutex<Vec<Weak<BlockingWriter>>>>,
) {
    let stream = match TcpStream::connect_timeout(&addr, timeout) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!(addr = %addr, error = %e, "Connect failed");
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
    }
    if let Err(e) = stream.set_write_timeout(Some(WRITE_TIMEOUT)) {
        tracing::warn!(addr = %addr, error = %e, "Failed to set write timeout");
    }
    let writer = match BlockingWriter::new(&stream) {
        Ok(writer) => Arc::new(writer),
        Err(e) => {
            tracing::warn!(addr = %addr, error = %e, "Failed to clone socket");
            return;
        }
    };

    {
        let mut live = live.lock();
        live.retain(|w| w.strong_count() > 0);
        live.push(Arc::downgrade(&writer));
    }
    if shut_down.load(Ordering::Acquire) {
        writer.close();
        return;
    }

    tracing::debug!(addr = %addr, "TCP connection established");
    guard.handler().on_connected(writer.clone());

    let mut stream = stream;
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                tracing::debug!(addr = %addr, "Connection closed by remote");
                break;
            }
            Ok(n) => guard.handler().on_bytes(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "Socket read failed");
                break;
            }
        }
    }
    writer.close();
}

impl Transport for BlockingTransport {
    fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        handler: Arc<dyn ConnectionHandler>,
    ) -> PeerResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(PeerError::Transport("transport shut down".to_owned()));
        }
        let shut_down = self.shut_down.clone();
        let live = self.live.clone();
        let guard = DisconnectGuard::new(handler);

        thread::Builder::new()
            .name(format!("peer-{addr}"))
            .spawn(move || run_connection(addr, timeout, guard, shut_down, live))?;
        Ok(())
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let writers: Vec<_> = self.live.lock().drain(..).collect();
        for writer in writers.iter().filter_map(Weak::upgrade) {
            writer.close();
        }
    }
}
