//! Bounded blocking FIFO queue.
//!
//! A fixed-size ring buffer used to back-pressure producers into slow
//! consumers (the uplink forwarder). This is intentionally not a channel:
//! the surface includes a non-blocking [`Queue::put_nowait`], [`Queue::len`]
//! and [`Queue::close`].
//!
//! Blocking operations take a [`CancellationToken`]; a cancelled `put`
//! returns silently without enqueueing, a cancelled `get` returns `None`
//! without consuming. `close()` is monotonic and wakes every blocked
//! producer and consumer; a closed queue still drains its remaining
//! elements through `get`.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct State<T> {
    ring: VecDeque<T>,
    size: usize,
    closed: bool,
}

/// A bounded multi-producer multi-consumer FIFO queue.
pub struct Queue<T> {
    state: Mutex<State<T>>,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> Queue<T> {
    /// Creates a queue holding at most `size` elements.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "queue size must be positive");

        Self {
            state: Mutex::new(State {
                ring: VecDeque::with_capacity(size),
                size,
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Enqueues `value`, waiting for space.
    ///
    /// Returns silently without enqueueing if the queue is closed or the
    /// token is cancelled while waiting.
    pub async fn put(&self, token: &CancellationToken, value: T) {
        let mut value = Some(value);

        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);

            {
                let mut state = self.state.lock();

                if state.closed {
                    return;
                }

                if state.ring.len() < state.size {
                    if let Some(value) = value.take() {
                        state.ring.push_back(value);
                    }

                    drop(state);
                    self.not_empty.notify_one();

                    return;
                }

                // Register for a wakeup before releasing the lock, so a
                // concurrent get cannot slip through unnoticed.
                notified.as_mut().enable();
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = token.cancelled() => return,
            }
        }
    }

    /// Enqueues `value` without waiting. Returns `false` when the queue is
    /// full or closed.
    pub fn put_nowait(&self, value: T) -> bool {
        let mut state = self.state.lock();

        if state.closed || state.ring.len() == state.size {
            return false;
        }

        state.ring.push_back(value);
        drop(state);
        self.not_empty.notify_one();

        true
    }

    /// Dequeues the oldest element, waiting for one.
    ///
    /// Returns `None` if the queue is closed and drained, or the token is
    /// cancelled while waiting. A cancelled `get` never consumes an
    /// element.
    pub async fn get(&self, token: &CancellationToken) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);

            {
                let mut state = self.state.lock();

                if let Some(value) = state.ring.pop_front() {
                    drop(state);
                    self.not_full.notify_one();

                    return Some(value);
                }

                if state.closed {
                    return None;
                }

                notified.as_mut().enable();
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = token.cancelled() => return None,
            }
        }
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.state.lock().ring.len()
    }

    /// Whether the queue currently holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the queue and wakes every blocked producer and consumer.
    /// Closing is monotonic: once closed, the queue stays closed.
    pub fn close(&self) {
        self.state.lock().closed = true;

        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}
