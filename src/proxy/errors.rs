//! Error channel
//!
//! A bounded multi-producer, single-consumer queue of [`ProxyError`]s.
//! Sending never blocks: when the buffer is full the oldest unread error is
//! dropped to make room. The receiver yields `None` once every sender is gone
//! and the queue is drained.

use log::{trace, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use crate::common::ProxyError;

struct Shared {
    queue: Mutex<VecDeque<ProxyError>>,
    capacity: usize,
    senders: AtomicUsize,
    receiver_gone: AtomicBool,
    dropped: AtomicU64,
    notify: Notify,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<ProxyError>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create an error channel buffering at most `capacity` errors
pub fn error_channel(capacity: usize) -> (ErrorSender, ErrorReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        capacity: capacity.max(1),
        senders: AtomicUsize::new(1),
        receiver_gone: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
        notify: Notify::new(),
    });

    (
        ErrorSender {
            shared: Arc::clone(&shared),
        },
        ErrorReceiver { shared },
    )
}

/// Producer half of the error channel
pub struct ErrorSender {
    shared: Arc<Shared>,
}

impl ErrorSender {
    /// Queue `err` without blocking
    ///
    /// Returns `false` when the receiver is gone.
    pub fn send(&self, err: ProxyError) -> bool {
        if self.is_closed() {
            trace!("Error channel closed, discarding: {}", err);
            return false;
        }

        {
            let mut queue = self.shared.queue();
            if queue.len() >= self.shared.capacity {
                if let Some(oldest) = queue.pop_front() {
                    let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!("Error channel full, dropping oldest error ({} so far): {}", dropped, oldest);
                }
            }
            queue.push_back(err);
        }
        self.shared.notify.notify_one();
        true
    }

    /// Whether the receiver has been dropped
    pub fn is_closed(&self) -> bool {
        self.shared.receiver_gone.load(Ordering::Acquire)
    }
}

impl Clone for ErrorSender {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for ErrorSender {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            // wake a receiver parked on an empty queue
            self.shared.notify.notify_waiters();
            self.shared.notify.notify_one();
        }
    }
}

impl std::fmt::Debug for ErrorSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorSender")
            .field("senders", &self.shared.senders.load(Ordering::Relaxed))
            .finish()
    }
}

/// Consumer half of the error channel
pub struct ErrorReceiver {
    shared: Arc<Shared>,
}

impl ErrorReceiver {
    /// Wait for the next error
    ///
    /// Returns `None` once all senders are dropped and the queue is empty.
    pub async fn recv(&mut self) -> Option<ProxyError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(err) = self.shared.queue().pop_front() {
                return Some(err);
            }
            if self.shared.senders.load(Ordering::Acquire) == 0 {
                return None;
            }

            notified.await;
        }
    }

    /// Take the next error if one is queued
    pub fn try_recv(&mut self) -> Option<ProxyError> {
        self.shared.queue().pop_front()
    }

    /// Number of errors discarded because the buffer was full
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Whether every sender is gone
    pub fn is_closed(&self) -> bool {
        self.shared.senders.load(Ordering::Acquire) == 0
    }
}

impl Drop for ErrorReceiver {
    fn drop(&mut self) {
        self.shared.receiver_gone.store(true, Ordering::Release);
        self.shared.queue().clear();
    }
}

impl std::fmt::Debug for ErrorReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReceiver")
            .field("queued", &self.shared.queue().len())
            .field("dropped", &self.dropped())
            .finish()
    }
}
