//! Bounded-concurrency gate with a priority-ordered wait queue, FIFO
//! tie-break. Grounded on `app/services/priority_limiter.py::PriorityLimiter`:
//! same binary-heap-of-waiters shape, translated to an explicit
//! `tokio::sync::oneshot` wakeup instead of resolving a future in place.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;

struct Waiter {
    priority: i64,
    order: u64,
    tx: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.order == other.order
    }
}
impl Eq for Waiter {}
impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; we want the *lowest* priority (and
        // earliest insertion order) to sort first, so reverse both.
        (Reverse(self.priority), Reverse(self.order)).cmp(&(Reverse(other.priority), Reverse(other.order)))
    }
}

struct State {
    max_concurrency: usize,
    current: usize,
    waiters: BinaryHeap<Waiter>,
    next_order: u64,
}

/// Bounded concurrency with a priority-ordered wait queue.
///
/// At most `max_concurrency` holders are active at any time. When a slot
/// frees, the waiter with the lowest numeric priority wakes, ties broken by
/// insertion order. The internal mutex wraps only queue bookkeeping — no
/// `.await` happens while it is held.
pub struct PriorityLimiter {
    state: Mutex<State>,
}

/// RAII guard returned by [`PriorityLimiter::limit`]; releases the slot on
/// drop. `wait_ms` is the time spent waiting for the slot, for metrics.
pub struct LimiterGuard<'a> {
    limiter: &'a PriorityLimiter,
    pub wait_ms: f64,
}

impl Drop for LimiterGuard<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

impl PriorityLimiter {
    /// # Panics
    /// Panics if `max_concurrency` is zero.
    #[must_use]
    pub fn new(max_concurrency: usize) -> Self {
        assert!(max_concurrency >= 1, "max_concurrency must be >= 1");
        Self {
            state: Mutex::new(State {
                max_concurrency,
                current: 0,
                waiters: BinaryHeap::new(),
                next_order: 0,
            }),
        }
    }

    /// Acquires a slot at `priority` (lower = earlier), returning the time
    /// spent waiting in milliseconds.
    pub async fn acquire(&self, priority: i64) -> f64 {
        let rx = {
            let mut state = self.state.lock();
            if state.current < state.max_concurrency && state.waiters.is_empty() {
                state.current += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let order = state.next_order;
                state.next_order += 1;
                state.waiters.push(Waiter {
                    priority,
                    order,
                    tx,
                });
                Some(rx)
            }
        };
        match rx {
            None => 0.0,
            Some(rx) => {
                let wait_start = Instant::now();
                // A cancelled sender (waiter dropped before wakeup) resolves
                // to an error; the next `release` simply moves on to the
                // next eligible waiter, so no slot leaks.
                let _ = rx.await;
                (Instant::now() - wait_start).as_secs_f64() * 1000.0
            }
        }
    }

    /// Releases a held slot, waking the next eligible waiter if any.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.current = state.current.saturating_sub(1);
        while let Some(waiter) = state.waiters.pop() {
            if waiter.tx.send(()).is_err() {
                // Waiter was cancelled; try the next one without
                // consuming a slot.
                continue;
            }
            state.current += 1;
            return;
        }
    }

    /// Acquires a slot and returns an RAII guard that releases it on drop.
    pub async fn limit(&self, priority: i64) -> LimiterGuard<'_> {
        let wait_ms = self.acquire(priority).await;
        LimiterGuard { limiter: self, wait_ms }
    }

    /// Grows or shrinks the concurrency cap, waking additional waiters if
    /// the cap grew.
    ///
    /// # Panics
    /// Panics if `max_concurrency` is zero.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        assert!(max_concurrency >= 1, "max_concurrency must be >= 1");
        let mut state = self.state.lock();
        state.max_concurrency = max_concurrency;
        while state.current < state.max_concurrency {
            match state.waiters.pop() {
                Some(waiter) => {
                    if waiter.tx.send(()).is_err() {
                        continue;
                    }
                    state.current += 1;
                }
                None => break,
            }
        }
    }

    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.state.lock().max_concurrency
    }

    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.state.lock().waiters.len()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().current
    }
}
