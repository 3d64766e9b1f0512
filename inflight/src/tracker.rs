//! Pending-acknowledgement set with a bounded drain.
//!
//! Ids enter the set when the transport accepts an asynchronous send and
//! leave it when the acknowledgement (success or failure) is observed.
//! `drain` waits until the set is empty or a deadline passes.
//!
//! The blocking drain parks on a condvar that `untrack` signals when the set
//! empties, but never sleeps longer than the poll interval between checks,
//! so it behaves like a fixed-interval poller with lower latency. The lock
//! is released while waiting.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::error::{InflightError, Result};

/// Default interval between pending-set checks while draining: 5 ms.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Floor for the poll interval; a zero period would spin.
const MIN_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Tracks identifiers of asynchronous operations awaiting acknowledgement.
#[derive(Debug)]
pub struct AckTracker {
    /// Ids accepted by the transport and not yet acknowledged.
    pending: Mutex<HashSet<String>>,
    /// Signalled whenever `pending` becomes empty.
    drained: Condvar,
    /// Upper bound on the time between two checks in `drain`.
    poll_interval: Duration,
}

impl AckTracker {
    /// Create an empty tracker with the default 5 ms poll interval.
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Create an empty tracker with a custom poll interval.
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            pending: Mutex::new(HashSet::new()),
            drained: Condvar::new(),
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        }
    }

    /// Register `id` as pending. Tracking an id twice is idempotent.
    pub fn track(&self, id: impl Into<String>) {
        self.pending.lock().insert(id.into());
    }

    /// Remove `id` from the pending set.
    ///
    /// Removing an id that is not pending is a no-op; this absorbs completion
    /// callbacks that fire more than once or for sends that were never
    /// tracked. Returns `true` if the id was pending.
    pub fn untrack(&self, id: &str) -> bool {
        let removed = {
            let mut pending = self.pending.lock();
            let removed = pending.remove(id);
            if pending.is_empty() {
                self.drained.notify_all();
            }
            removed
        };
        if !removed {
            debug!(id, "untrack ignored: id was not pending");
        }
        removed
    }

    /// Number of ids still awaiting acknowledgement.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns `true` if `id` is awaiting acknowledgement.
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.lock().contains(id)
    }

    /// Returns `true` if nothing is awaiting acknowledgement.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Returns the interval between pending-set checks.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Block the calling thread until every pending id is untracked.
    ///
    /// Returns `Ok(())` as soon as the set is empty. If `timeout` elapses
    /// first, returns `InflightError::DrainTimeout` carrying the number of
    /// ids still pending at that instant. There is no partial success.
    pub fn drain(&self, timeout: Duration) -> Result<()> {
        // An unrepresentable deadline means "wait forever".
        let deadline = Instant::now().checked_add(timeout);
        let mut pending = self.pending.lock();
        loop {
            if pending.is_empty() {
                return Ok(());
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(InflightError::DrainTimeout {
                            remaining: pending.len(),
                        });
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };

            self.drained.wait_for(&mut pending, wait);
        }
    }

    /// Async counterpart of [`drain`](Self::drain) for callers inside a tokio
    /// runtime. Checks the pending set once per poll interval.
    pub async fn drain_async(&self, timeout: Duration) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let wait_empty = async {
            loop {
                ticker.tick().await;
                if self.is_empty() {
                    return;
                }
            }
        };

        match tokio::time::timeout(timeout, wait_empty).await {
            Ok(()) => Ok(()),
            Err(_) => match self.pending() {
                0 => Ok(()),
                remaining => Err(InflightError::DrainTimeout { remaining }),
            },
        }
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}
