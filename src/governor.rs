//! Concurrency governor: a counting semaphore with runtime-adjustable capacity.
//!
//! The governor bounds how many device operations (primarily captures) run at once
//! across the whole registry, so a burst of work cannot saturate shared network or
//! bus bandwidth. `tokio::sync::Semaphore` cannot shrink its permit count in place,
//! so permits are tracked explicitly under a small mutex with a `Notify` for
//! suspension — no busy-waiting.
//!
//! Capacity changes take effect for future acquisitions only; current holders are
//! never evicted. Permits release on drop, so a panicking or cancelled holder still
//! returns its permit and forward progress is guaranteed.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::{DeviceError, Result};

#[derive(Debug)]
struct GovernorState {
    capacity: usize,
    held: usize,
}

/// Adjustable counting semaphore gating bandwidth-sensitive device operations.
#[derive(Debug)]
pub struct Governor {
    state: Mutex<GovernorState>,
    notify: Notify,
}

impl Governor {
    /// Create a governor with the given capacity (must be at least 1).
    pub fn new(capacity: usize) -> Result<Arc<Self>> {
        if capacity < 1 {
            return Err(DeviceError::InvalidArgument(
                "concurrency capacity must be at least 1".into(),
            ));
        }
        Ok(Arc::new(Self {
            state: Mutex::new(GovernorState { capacity, held: 0 }),
            notify: Notify::new(),
        }))
    }

    /// Acquire one permit, suspending until one is available.
    ///
    /// The permit releases itself when dropped, whether the holder finished,
    /// failed, or was cancelled.
    pub async fn acquire(self: &Arc<Self>) -> GovernorPermit {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking, so a release between the
            // check and the await cannot be missed.
            notified.as_mut().enable();

            {
                let mut state = self.lock_state();
                if state.held < state.capacity {
                    state.held += 1;
                    return GovernorPermit {
                        governor: Arc::clone(self),
                    };
                }
            }

            notified.await;
        }
    }

    /// Change the capacity for future acquisitions. Never evicts current holders;
    /// if capacity drops below the held count, acquisitions block until enough
    /// permits drain back.
    pub fn set_capacity(&self, capacity: usize) -> Result<()> {
        if capacity < 1 {
            return Err(DeviceError::InvalidArgument(
                "concurrency capacity must be at least 1".into(),
            ));
        }
        self.lock_state().capacity = capacity;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Current capacity.
    pub fn capacity(&self) -> usize {
        self.lock_state().capacity
    }

    /// Number of permits currently held.
    pub fn held(&self) -> usize {
        self.lock_state().held
    }

    fn release(&self) {
        let mut state = self.lock_state();
        state.held = state.held.saturating_sub(1);
        drop(state);
        self.notify.notify_waiters();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GovernorState> {
        // Counter updates cannot leave the state inconsistent, so a poisoned
        // lock is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A held governor permit. Dropping it returns the permit unconditionally.
#[derive(Debug)]
pub struct GovernorPermit {
    governor: Arc<Governor>,
}

impl Drop for GovernorPermit {
    fn drop(&mut self) {
        self.governor.release();
    }
}
