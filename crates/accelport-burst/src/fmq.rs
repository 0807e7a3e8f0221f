use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use tracing::debug;

/// Default per-channel capacity in datum elements.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// A fixed-capacity single-producer/single-consumer ring channel with
/// polling-then-blocking reads and idempotent invalidation.
///
/// The reader busy-polls for a bounded window (trading power for latency)
/// before parking on a condvar; the writer wakes it after every packet.
pub struct RingChannel<T> {
    queue: ArrayQueue<T>,
    // Guards the sleep/wake handshake, never the queue itself.
    parker: Mutex<()>,
    wakeup: Condvar,
    invalidated: AtomicBool,
}

impl<T: Copy> RingChannel<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            parker: Mutex::new(()),
            wakeup: Condvar::new(),
            invalidated: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Writes a whole packet, all-or-nothing. Returns false without blocking
    /// when the channel is invalidated or lacks space.
    pub fn write(&self, packet: &[T]) -> bool {
        if self.is_invalidated() {
            return false;
        }
        if packet.len() > self.queue.capacity() - self.queue.len() {
            debug!(
                len = packet.len(),
                free = self.queue.capacity() - self.queue.len(),
                "ring channel full"
            );
            return false;
        }
        for &datum in packet {
            if self.queue.push(datum).is_err() {
                // Single producer, so the space check above makes this
                // unreachable; treat it as a failed write regardless.
                return false;
            }
        }
        drop(self.parker.lock().unwrap());
        self.wakeup.notify_all();
        true
    }

    /// Reads one datum: busy-polls for `polling_window`, then blocks. None
    /// once the channel is invalidated.
    pub fn read(&self, polling_window: Duration) -> Option<T> {
        // Fast path first; a zero window skips straight to blocking.
        if !polling_window.is_zero() {
            let deadline = Instant::now() + polling_window;
            loop {
                if self.is_invalidated() {
                    return None;
                }
                if let Some(datum) = self.queue.pop() {
                    return Some(datum);
                }
                if Instant::now() >= deadline {
                    break;
                }
                std::hint::spin_loop();
            }
        }

        let mut guard = self.parker.lock().unwrap();
        loop {
            if self.is_invalidated() {
                return None;
            }
            if let Some(datum) = self.queue.pop() {
                return Some(datum);
            }
            guard = self.wakeup.wait(guard).unwrap();
        }
    }

    /// Reads exactly `n` datums after the first has already announced the
    /// packet size. None on invalidation mid-packet.
    pub fn read_exact(&self, n: usize, polling_window: Duration) -> Option<Vec<T>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.read(polling_window)?);
        }
        Some(out)
    }

    /// Idempotent; any blocked reader wakes and observes the invalidation.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
        drop(self.parker.lock().unwrap());
        self.wakeup.notify_all();
    }
}
