//! Per-request control: cancellation signals and deadlines

use crate::error::{QdbError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Cooperative cancellation signal. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Control handles threaded through one engine call.
///
/// Checked at every suspension point: before each upstream attempt, between
/// sub-windows, and while queued for an upstream permit. Work already
/// committed to the store stays committed.
#[derive(Debug, Clone, Default)]
pub struct RequestCtx {
    pub cancel: CancelToken,
    pub deadline: Option<Instant>,
}

impl RequestCtx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self { cancel: CancelToken::new(), deadline: Some(deadline) }
    }

    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self { cancel, deadline: None }
    }

    /// Error out if the caller canceled or the deadline passed. The timeout
    /// marker carries no ranges; the engine fills in what is still missing
    /// when it surfaces the failure.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_canceled() {
            return Err(QdbError::Canceled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(QdbError::Timeout { missing_ranges: Vec::new() });
            }
        }
        Ok(())
    }

    /// Time left until the deadline, if one is set.
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }
}
