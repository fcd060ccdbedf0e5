//! Bound on concurrent upstream calls with a FIFO overflow queue
//!
//! Excess callers wait in arrival order; when the queue itself is full the
//! caller is rejected with `Overloaded` before any upstream work starts.

use crate::error::{QdbError, Result};
use crate::request::RequestCtx;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Poll interval while queued, so cancellation and deadlines are observed.
const WAIT_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug, Default)]
struct GateState {
    active: usize,
    queue: VecDeque<u64>,
    next_ticket: u64,
}

/// Concurrency gate for upstream calls.
#[derive(Debug)]
pub struct UpstreamGate {
    state: Mutex<GateState>,
    cv: Condvar,
    max_active: usize,
    max_queue: usize,
}

impl UpstreamGate {
    pub fn new(max_active: usize, max_queue: usize) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cv: Condvar::new(),
            max_active: max_active.max(1),
            max_queue,
        }
    }

    /// Wait for an upstream permit in FIFO order.
    pub fn acquire(&self, ctx: &RequestCtx) -> Result<GatePermit<'_>> {
        let mut state = self.state.lock().unwrap();
        if state.queue.is_empty() && state.active < self.max_active {
            state.active += 1;
            return Ok(GatePermit { gate: self });
        }
        if state.queue.len() >= self.max_queue {
            return Err(QdbError::Overloaded);
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);

        loop {
            if state.queue.front() == Some(&ticket) && state.active < self.max_active {
                state.queue.pop_front();
                state.active += 1;
                self.cv.notify_all();
                return Ok(GatePermit { gate: self });
            }
            let (guard, _) = self.cv.wait_timeout(state, WAIT_SLICE).unwrap();
            state = guard;
            if let Err(err) = ctx.check() {
                state.queue.retain(|t| *t != ticket);
                self.cv.notify_all();
                return Err(err);
            }
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.active -= 1;
        drop(state);
        self.cv.notify_all();
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.state.lock().unwrap().active
    }
}

/// RAII upstream permit.
#[derive(Debug)]
pub struct GatePermit<'a> {
    gate: &'a UpstreamGate,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_bounds_concurrency() {
        let gate = Arc::new(UpstreamGate::new(2, 16));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..6 {
                let gate = gate.clone();
                let running = running.clone();
                let peak = peak.clone();
                scope.spawn(move || {
                    let permit = gate.acquire(&RequestCtx::new()).unwrap();
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(15));
                    running.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                });
            }
        });

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(gate.active(), 0);
    }

    #[test]
    fn test_queue_overflow_rejected() {
        let gate = UpstreamGate::new(1, 0);
        let permit = gate.acquire(&RequestCtx::new()).unwrap();
        // Queue capacity is zero: the second caller is rejected outright.
        assert!(matches!(
            gate.acquire(&RequestCtx::new()),
            Err(QdbError::Overloaded)
        ));
        drop(permit);
        assert!(gate.acquire(&RequestCtx::new()).is_ok());
    }

    #[test]
    fn test_queued_caller_honors_cancellation() {
        let gate = Arc::new(UpstreamGate::new(1, 4));
        let _held = gate.acquire(&RequestCtx::new()).unwrap();

        let ctx = RequestCtx::new();
        ctx.cancel.cancel();
        let err = gate.acquire(&ctx).unwrap_err();
        assert!(matches!(err, QdbError::Canceled));
        // The abandoned ticket must not wedge the queue.
        drop(_held);
        assert!(gate.acquire(&RequestCtx::new()).is_ok());
    }
}
