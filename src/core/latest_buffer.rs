//! # Latest-Wins Buffer
//!
//! A capacity-one channel between a fast producer (the camera) and a slower
//! consumer (display or analysis). Writing while a value is still unread
//! replaces it, so the consumer always sees the most recent frame and the
//! producer never waits.
//!
//! ```text
//! push(A) push(B) push(C)          recv() -> C
//!   │       │       │                 ▲
//!   └──▶ [ slot ] ──┴── A, B dropped ─┘
//! ```
//!
//! The sender closes the buffer explicitly or when dropped. A closed buffer
//! still hands out its last unread value before `recv` returns `None`.

use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicU64, Ordering},
};

use futures_util::Stream;
use tokio::sync::Notify;

struct Slot<T> {
    value: Option<T>,
    closed: bool,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    notify: Notify,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        // A panic while holding the lock cannot leave the slot half-written.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn close(&self) {
        let mut slot = self.lock();
        if !slot.closed {
            slot.closed = true;
            drop(slot);
            self.notify.notify_one();
        }
    }
}

/// Counters of a latest-wins buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Values accepted by `push`
    pub pushed: u64,
    /// Values overwritten before the consumer read them
    pub dropped: u64,
}

/// Write half of a latest-wins buffer. Closes the buffer when dropped.
pub struct LatestSender<T> {
    shared: Arc<Shared<T>>,
}

/// Read half of a latest-wins buffer.
pub struct LatestReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Create a connected latest-wins sender/receiver pair.
pub fn latest_channel<T>() -> (LatestSender<T>, LatestReceiver<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot {
            value: None,
            closed: false,
        }),
        notify: Notify::new(),
        pushed: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
    });
    (
        LatestSender {
            shared: Arc::clone(&shared),
        },
        LatestReceiver { shared },
    )
}

impl<T> LatestSender<T> {
    /// Store `value`, replacing any unread value.
    ///
    /// Returns the value back when the buffer is closed.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut slot = self.shared.lock();
        if slot.closed {
            return Err(value);
        }
        if slot.value.replace(value).is_some() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.pushed.fetch_add(1, Ordering::Relaxed);
        drop(slot);
        self.shared.notify.notify_one();
        Ok(())
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn stats(&self) -> BufferStats {
        stats(&self.shared)
    }
}

impl<T> Drop for LatestSender<T> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl<T> LatestReceiver<T> {
    /// Wait for the next value. Returns `None` once the buffer is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut slot = self.shared.lock();
                if let Some(value) = slot.value.take() {
                    return Some(value);
                }
                if slot.closed {
                    return None;
                }
            }
            // notify_one keeps a permit when nobody waits, so a push between
            // the unlock above and this await is not lost.
            self.shared.notify.notified().await;
        }
    }

    /// Take the buffered value without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.shared.lock().value.take()
    }

    /// Discard any buffered value. Returns whether one was present.
    pub fn drain(&mut self) -> bool {
        self.try_recv().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn stats(&self) -> BufferStats {
        stats(&self.shared)
    }

    /// Turn the receiver into a stream that ends when the buffer closes.
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static
    where
        T: Send + 'static,
    {
        futures_util::stream::unfold(self, |mut rx| async move {
            let value = rx.recv().await?;
            Some((value, rx))
        })
    }
}

fn stats<T>(shared: &Shared<T>) -> BufferStats {
    BufferStats {
        pushed: shared.pushed.load(Ordering::Relaxed),
        dropped: shared.dropped.load(Ordering::Relaxed),
    }
}
