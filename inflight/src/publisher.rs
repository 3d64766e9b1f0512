//! Publisher wrapper that keeps every unacknowledged send in an `AckTracker`.
//!
//! `DrainablePublisher::publish_async` hands the payload to the underlying
//! `Transport`, tracks the id it returns, and wraps the caller's ack handler
//! so the id is untracked before the caller sees the acknowledgement.
//! `shutdown` drains the tracker before the transport is closed.
//!
//! ## Early acknowledgements
//!
//! A transport may invoke the ack handler before `publish_async` has
//! returned the id (inline acks, or a fast reply racing the caller). Such an
//! id would be tracked after it was acknowledged and never leave the pending
//! set. While publishes are in progress, acks for ids that are not pending
//! are remembered, uncounted. The publish that receives one of those ids
//! skips tracking it and counts the ack then. A remembered ack is forgotten
//! once every publish that started before it has returned, so repeated acks
//! for ids that were already settled are never counted and never pile up.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ProducerConfig;
use crate::error::{InflightError, Result};
use crate::tracker::AckTracker;

/// Failure reported by the transport for one acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckError(pub String);

impl fmt::Display for AckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for AckError {}

/// Callback invoked by the transport when a publish is acknowledged.
///
/// Receives the publish id and, on failure, the transport's error. May be
/// invoked from any thread, and possibly more than once per id.
pub type AckHandler = Arc<dyn Fn(&str, Option<&AckError>) + Send + Sync>;

/// The asynchronous publishing surface of a message transport.
pub trait Transport: Send + Sync {
    /// Start an asynchronous publish. Returns the transport-assigned id once
    /// the send is accepted; `on_ack` fires when it is acknowledged.
    fn publish_async(&self, subject: &str, data: Bytes, on_ack: AckHandler) -> Result<String>;

    /// Publish and wait for the acknowledgement.
    fn publish(&self, subject: &str, data: Bytes) -> Result<()>;

    /// Release the underlying connection.
    fn close(&self) -> Result<()>;
}

/// A failed acknowledgement, queued for later inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFailure {
    pub id: String,
    pub reason: String,
}

/// Snapshot of publisher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishStats {
    /// Publishes accepted by the transport.
    pub messages_sent: u64,
    /// Acknowledgements observed, successful or not.
    pub acks_received: u64,
    /// Acknowledgements that reported an error.
    pub ack_failures: u64,
    /// Publishes still awaiting acknowledgement.
    pub pending: usize,
}

/// An ack for an id that was not pending when it arrived.
struct EarlyAck {
    /// Publishes started before the ack arrived; only those can own the id.
    seen_at: u64,
    err: Option<AckError>,
}

#[derive(Default)]
struct EarlyAcks {
    /// Ticket handed to the next publish.
    next_ticket: u64,
    /// Tickets of publishes currently inside `Transport::publish_async`.
    in_progress: BTreeSet<u64>,
    acked: HashMap<String, EarlyAck>,
}

impl EarlyAcks {
    fn begin(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.in_progress.insert(ticket);
        ticket
    }

    /// Finish publish `ticket` and forget acks no running publish can claim.
    fn end(&mut self, ticket: u64) {
        self.in_progress.remove(&ticket);
        match self.in_progress.first().copied() {
            Some(oldest) => self.acked.retain(|_, ack| ack.seen_at > oldest),
            None => self.acked.clear(),
        }
    }
}

struct Inner {
    tracker: AckTracker,
    early: Mutex<EarlyAcks>,
    sent: AtomicU64,
    acked: AtomicU64,
    failed: AtomicU64,
    failures: SegQueue<AckFailure>,
}

impl Inner {
    fn on_ack(&self, id: &str, err: Option<&AckError>) {
        let mut early = self.early.lock();
        if self.tracker.is_pending(id) {
            // Count before untracking so a drain that sees the set empty
            // also sees the counters.
            self.record_ack(id, err);
            self.tracker.untrack(id);
        } else if !early.in_progress.is_empty() && !early.acked.contains_key(id) {
            let seen_at = early.next_ticket;
            early.acked.insert(
                id.to_owned(),
                EarlyAck {
                    seen_at,
                    err: err.cloned(),
                },
            );
            debug!(id, "ack arrived before its publish returned");
        } else {
            debug!(id, "duplicate or unknown ack ignored");
        }
    }

    fn record_ack(&self, id: &str, err: Option<&AckError>) {
        self.acked.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = err {
            warn!(id, error = %err, "publish acknowledgement failed");
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.failures.push(AckFailure {
                id: id.to_owned(),
                reason: err.to_string(),
            });
        }
    }
}

/// Wraps a `Transport` so outstanding publishes can be drained at shutdown.
pub struct DrainablePublisher<T: Transport> {
    transport: T,
    config: ProducerConfig,
    inner: Arc<Inner>,
}

impl<T: Transport> DrainablePublisher<T> {
    /// Validate `config` and wrap `transport` with it.
    pub fn new(transport: T, config: ProducerConfig) -> Result<Self> {
        config.validate()?;
        let tracker = AckTracker::with_poll_interval(config.poll_interval());
        Ok(Self {
            transport,
            config,
            inner: Arc::new(Inner {
                tracker,
                early: Mutex::new(EarlyAcks::default()),
                sent: AtomicU64::new(0),
                acked: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                failures: SegQueue::new(),
            }),
        })
    }

    /// Returns the publisher configuration.
    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Returns the wrapped transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the tracker holding unacknowledged publish ids.
    pub fn tracker(&self) -> &AckTracker {
        &self.inner.tracker
    }

    /// Publish `data` on the configured subject.
    pub fn publish_async(&self, data: Bytes, on_ack: AckHandler) -> Result<String> {
        self.publish_async_to(&self.config.subject, data, on_ack)
    }

    /// Publish `data` on `subject`, tracking the returned id until the
    /// transport acknowledges it. `on_ack` runs after the id is untracked.
    ///
    /// Refused with `InflightLimit` while `max_inflight` publishes are
    /// unacknowledged or in progress.
    pub fn publish_async_to(&self, subject: &str, data: Bytes, on_ack: AckHandler) -> Result<String> {
        let ticket = {
            let mut early = self.inner.early.lock();
            let limit = self.config.max_inflight;
            if self.inner.tracker.pending() + early.in_progress.len() >= limit {
                debug!(limit, "publish refused at the inflight limit");
                return Err(InflightError::InflightLimit { limit });
            }
            early.begin()
        };

        let inner = Arc::clone(&self.inner);
        let wrapped: AckHandler = Arc::new(move |id: &str, err: Option<&AckError>| {
            inner.on_ack(id, err);
            on_ack(id, err);
        });
        let result = self.transport.publish_async(subject, data, wrapped);

        let mut early = self.inner.early.lock();
        if let Ok(id) = &result {
            match early.acked.remove(id) {
                Some(ack) => self.inner.record_ack(id, ack.err.as_ref()),
                None => self.inner.tracker.track(id.as_str()),
            }
            self.inner.sent.fetch_add(1, Ordering::Relaxed);
        }
        early.end(ticket);

        result
    }

    /// Publish synchronously; the acknowledgement is observed before return,
    /// so nothing is tracked.
    pub fn publish(&self, data: Bytes) -> Result<()> {
        self.transport.publish(&self.config.subject, data)?;
        self.inner.sent.fetch_add(1, Ordering::Relaxed);
        self.inner.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Block until every tracked publish is acknowledged or `timeout` elapses.
    pub fn drain(&self, timeout: Duration) -> Result<()> {
        self.inner.tracker.drain(timeout)
    }

    /// Async counterpart of [`drain`](Self::drain).
    pub async fn drain_async(&self, timeout: Duration) -> Result<()> {
        self.inner.tracker.drain_async(timeout).await
    }

    /// Drain outstanding acknowledgements, then close the transport.
    ///
    /// A drain timeout is logged and reported through the returned count of
    /// still-unacknowledged publishes; the connection is closed regardless.
    /// Only a failure to close is returned as an error.
    pub fn shutdown(&self) -> Result<usize> {
        let remaining = match self.drain(self.config.drain_timeout()) {
            Ok(()) => 0,
            Err(InflightError::DrainTimeout { remaining }) => {
                warn!(
                    remaining,
                    timeout_ms = self.config.drain_timeout_ms,
                    "closing with unacknowledged publishes"
                );
                remaining
            }
            Err(e) => return Err(e),
        };

        self.transport.close()?;
        debug!(client_id = %self.config.client_id, "transport closed");
        Ok(remaining)
    }

    /// Current publisher counters.
    pub fn stats(&self) -> PublishStats {
        PublishStats {
            messages_sent: self.inner.sent.load(Ordering::Relaxed),
            acks_received: self.inner.acked.load(Ordering::Relaxed),
            ack_failures: self.inner.failed.load(Ordering::Relaxed),
            pending: self.inner.tracker.pending(),
        }
    }

    /// Remove and return every queued acknowledgement failure.
    pub fn take_failures(&self) -> Vec<AckFailure> {
        std::iter::from_fn(|| self.inner.failures.pop()).collect()
    }
}
