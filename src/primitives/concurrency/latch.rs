use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::types::{ArbolError, Result};

struct Inner {
    held: Mutex<Option<u64>>,
    released: Condvar,
}

/// In-process single-writer latch. At most one transaction mutates pages at
/// a time; readers never take it.
#[derive(Clone)]
pub struct WriteLatch {
    inner: Arc<Inner>,
}

/// Held writer latch, released on drop.
pub struct WriteLatchGuard {
    inner: Arc<Inner>,
    holder: u64,
}

impl Default for WriteLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteLatch {
    /// Creates a free latch.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                held: Mutex::new(None),
                released: Condvar::new(),
            }),
        }
    }

    /// Waits up to `timeout` for the latch. `holder` is recorded for
    /// diagnostics only.
    pub fn acquire(&self, holder: u64, timeout: Duration) -> Result<WriteLatchGuard> {
        let deadline = Instant::now() + timeout;
        let mut held = self.inner.held.lock();
        while held.is_some() {
            if self.inner.released.wait_until(&mut held, deadline).timed_out() && held.is_some() {
                trace!(holder, current = ?*held, "latch.write.busy");
                return Err(ArbolError::WriterBusy(timeout));
            }
        }
        *held = Some(holder);
        trace!(holder, "latch.write.acquired");
        Ok(WriteLatchGuard {
            inner: Arc::clone(&self.inner),
            holder,
        })
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<u64> {
        *self.inner.held.lock()
    }
}

impl WriteLatchGuard {
    /// Holder the latch was acquired for.
    pub fn holder(&self) -> u64 {
        self.holder
    }
}

impl Drop for WriteLatchGuard {
    fn drop(&mut self) {
        *self.inner.held.lock() = None;
        self.inner.released.notify_one();
        trace!(holder = self.holder, "latch.write.released");
    }
}
