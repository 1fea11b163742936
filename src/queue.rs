//! Per-connection buffer between the transport's delivery path and consumers.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{PeerError, PeerResult};

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Ordered, bounded queue with a blocking pop that also wakes on close.
///
/// Once closed, consumers still drain what was queued and then get
/// [`PeerError::ConnectionClosed`].
#[derive(Debug)]
pub struct InboundMessageQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> InboundMessageQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Appends an item. Fails on a closed or full queue; the producer never blocks.
    pub fn push(&self, item: T) -> PeerResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(PeerError::ConnectionClosed);
        }
        if inner.items.len() >= self.capacity {
            return Err(PeerError::Transport(format!(
                "inbound queue full ({} messages)",
                self.capacity
            )));
        }
        inner.items.push_back(item);
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Blocks until an item arrives or the queue is closed and drained.
    pub fn pop(&self) -> PeerResult<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Ok(item);
            }
            if inner.closed {
                return Err(PeerError::ConnectionClosed);
            }
            self.available.wait(&mut inner);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout` with `Ok(None)`.
    pub fn pop_timeout(&self, timeout: Duration) -> PeerResult<Option<T>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Ok(Some(item));
            }
            if inner.closed {
                return Err(PeerError::ConnectionClosed);
            }
            if self.available.wait_until(&mut inner, deadline).timed_out() {
                return Ok(inner.items.pop_front());
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Closes the queue and wakes every blocked consumer. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        drop(inner);
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
