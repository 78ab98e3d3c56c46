//! Per-client outbound buffers.
//!
//! A bounded drop-oldest queue sits between bus deliveries and the socket
//! send loop.  Deliveries are acknowledged once enqueued here, so a slow
//! device never blocks the bus; under sustained slow-consumer conditions
//! the oldest undelivered frames are discarded and counted.  Deliveries are
//! therefore at-least-once to the buffer, not to the socket.

use fb_protocol::Frame;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Notify, RwLock};

/// What happened to an `enqueue` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// False only when the buffer was already closed.
    pub enqueued: bool,
    /// True when the oldest frame was discarded to make room.
    pub dropped_oldest: bool,
}

struct Inner {
    queue: VecDeque<Frame>,
    closed: bool,
}

/// Bounded drop-oldest frame queue with a single consumer.
pub struct OutboundBuffer {
    capacity: usize,
    inner: StdMutex<Inner>,
    notify: Notify,
    dropped: AtomicU64,
}

impl OutboundBuffer {
    pub fn new(capacity: usize) -> Self {
        OutboundBuffer {
            capacity: capacity.max(1),
            inner: StdMutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking enqueue with drop-oldest overflow.
    pub fn enqueue(&self, frame: Frame) -> EnqueueOutcome {
        let mut inner = self.inner.lock().expect("buffer mutex poisoned");
        if inner.closed {
            return EnqueueOutcome {
                enqueued: false,
                dropped_oldest: false,
            };
        }
        let mut dropped_oldest = false;
        if inner.queue.len() >= self.capacity {
            inner.queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            dropped_oldest = true;
        }
        inner.queue.push_back(frame);
        drop(inner);
        self.notify.notify_waiters();
        EnqueueOutcome {
            enqueued: true,
            dropped_oldest,
        }
    }

    /// Await the next frame.  Returns None once the buffer is closed and
    /// fully drained.
    pub async fn recv(&self) -> Option<Frame> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("buffer mutex poisoned");
                if let Some(frame) = inner.queue.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Pop without waiting; used to flush at drain time.
    pub fn try_recv(&self) -> Option<Frame> {
        self.inner
            .lock()
            .expect("buffer mutex poisoned")
            .queue
            .pop_front()
    }

    /// Close the buffer; the consumer drains what is queued, then sees None.
    pub fn close(&self) {
        self.inner.lock().expect("buffer mutex poisoned").closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("buffer mutex poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The per-client buffer map, mirroring connection registration.
#[derive(Default)]
pub struct OutboundBuffers {
    inner: RwLock<HashMap<String, Arc<OutboundBuffer>>>,
}

impl OutboundBuffers {
    pub fn new() -> Self {
        OutboundBuffers::default()
    }

    /// Create a fresh buffer for a client, replacing (and closing) any
    /// previous one.
    pub async fn create(&self, client_id: &str, capacity: usize) -> Arc<OutboundBuffer> {
        let buffer = Arc::new(OutboundBuffer::new(capacity));
        if let Some(old) = self
            .inner
            .write()
            .await
            .insert(client_id.to_owned(), Arc::clone(&buffer))
        {
            old.close();
        }
        buffer
    }

    pub async fn get(&self, client_id: &str) -> Option<Arc<OutboundBuffer>> {
        self.inner.read().await.get(client_id).cloned()
    }

    /// Remove the client's buffer only if it is still `buffer` (a newer
    /// session may have replaced it).
    pub async fn remove_if_same(&self, client_id: &str, buffer: &Arc<OutboundBuffer>) {
        let mut inner = self.inner.write().await;
        if inner
            .get(client_id)
            .is_some_and(|current| Arc::ptr_eq(current, buffer))
        {
            inner.remove(client_id);
        }
    }
}
