use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// A bounded per-client outbound queue with a "drop oldest, enqueue newest"
/// overflow policy (fail-fresh): a client that stops reading loses history,
/// not connectivity.
pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Enqueue a message, dropping the oldest queued message if at capacity.
    pub fn push(&self, item: T) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut guard = self.inner.lock().unwrap();
            if guard.len() >= self.capacity {
                guard.pop_front();
            }
            guard.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Wait for the next message, or `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            {
                let mut guard = self.inner.lock().unwrap();
                if let Some(item) = guard.pop_front() {
                    return Some(item);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}
