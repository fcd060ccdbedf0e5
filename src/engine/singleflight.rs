//! Per-fingerprint single-flight locks
//!
//! At most one computation per series fingerprint runs at a time. A caller
//! arriving while an identical fingerprint is in flight waits; when the
//! in-flight window covers its own, the waiter's subsequent gap plan is
//! empty and the shared result is observed from the store. Slots are created
//! at request start and dropped when the last waiter leaves.

use crate::error::Result;
use crate::request::RequestCtx;
use crate::types::SeriesKey;
use chrono::NaiveDate;
use hashbrown::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Inclusive request window.
pub type Window = (NaiveDate, NaiveDate);

/// Poll interval while parked, so cancellation and deadlines are observed.
const WAIT_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug, Default)]
struct SlotState {
    busy: bool,
    window: Option<Window>,
    waiters: usize,
}

#[derive(Debug, Default)]
struct Slot {
    state: Mutex<SlotState>,
    cv: Condvar,
}

/// Map from fingerprint to its in-flight slot.
#[derive(Debug, Default)]
pub struct FlightTable {
    slots: Mutex<HashMap<SeriesKey, Arc<Slot>>>,
}

impl FlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the fingerprint lock, waiting behind any in-flight
    /// computation. The returned guard reports whether this caller waited
    /// for a flight whose window already covered its own.
    pub fn acquire<'a>(
        &'a self,
        key: SeriesKey,
        window: Window,
        ctx: &RequestCtx,
    ) -> Result<FlightGuard<'a>> {
        let slot = {
            let mut slots = self.slots.lock().unwrap();
            let slot = slots.entry(key).or_default().clone();
            // Registered under the table lock so an unlocking holder never
            // reaps a slot a new arrival is about to wait on.
            slot.state.lock().unwrap().waiters += 1;
            slot
        };

        let mut state = slot.state.lock().unwrap();
        let mut covered = false;
        while state.busy {
            if let Some((s, e)) = state.window {
                if window.0 >= s && window.1 <= e {
                    covered = true;
                }
            }
            let (guard, _) = slot.cv.wait_timeout(state, WAIT_SLICE).unwrap();
            state = guard;
            if let Err(err) = ctx.check() {
                drop(state);
                self.release(key, false);
                return Err(err);
            }
        }
        state.busy = true;
        state.window = Some(window);
        drop(state);

        Ok(FlightGuard { table: self, key, covered_by_inflight: covered, released: false })
    }

    fn release(&self, key: SeriesKey, finished: bool) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get(&key).cloned() {
            let mut state = slot.state.lock().unwrap();
            if finished {
                state.busy = false;
                state.window = None;
            }
            state.waiters -= 1;
            let empty = state.waiters == 0;
            slot.cv.notify_all();
            drop(state);
            if empty {
                slots.remove(&key);
            }
        }
    }

    /// Number of live slots (test observability).
    #[cfg(test)]
    pub fn slot_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

/// RAII holder of one fingerprint lock.
#[derive(Debug)]
pub struct FlightGuard<'a> {
    table: &'a FlightTable,
    key: SeriesKey,
    /// The caller waited behind a flight whose window was a superset of its
    /// own request.
    pub covered_by_inflight: bool,
    released: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.table.release(self.key, true);
        }
    }
}
