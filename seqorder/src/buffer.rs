//! Sequence window: payloads keyed by transport sequence number, plus the
//! cursor naming the next sequence to emit.
//!
//! The cursor is unset until the buffer is initialized, at which point it
//! is fixed to the smallest buffered sequence. From then on:
//! - arrivals below the cursor are rejected as stale and change nothing;
//! - the entry at the cursor is removed only when it is emitted, and only
//!   then does the cursor advance by one;
//! - a missing sequence (a gap) holds back everything above it until it
//!   arrives. There is no skip or eviction.
//!
//! A BTreeMap keeps initialization (smallest key) cheap and emission order
//! trivially correct.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, SeqOrderError};
use crate::stream::{ConsumeOptions, OrderedStream};

/// What `add` does with a second payload for a sequence that is buffered
/// but not yet emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// The later payload replaces the earlier one (treated as a correction).
    #[default]
    LastWriteWins,
    /// The earlier payload is kept; later ones are ignored as redeliveries.
    FirstWriteWins,
}

/// Lifecycle of a sequence buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// No cursor yet; arrivals are held.
    Uninitialized,
    /// A consumer is waiting for the initialization window to elapse.
    Initializing,
    /// Cursor fixed; contiguous items are emitted from it.
    Active { cursor: u64 },
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferState::Uninitialized => write!(f, "Uninitialized"),
            BufferState::Initializing => write!(f, "Initializing"),
            BufferState::Active { cursor } => write!(f, "Active(cursor={cursor})"),
        }
    }
}

struct Window<T> {
    /// Next sequence to emit; `None` until initialized.
    cursor: Option<u64>,
    /// Buffered payloads awaiting emission.
    entries: BTreeMap<u64, T>,
    /// `u64::MAX` has been emitted; every sequence is stale from now on.
    exhausted: bool,
    /// The initializer task is still running.
    initializing: bool,
    /// `consume` has been called.
    consumed: bool,
}

/// Reorders `(sequence, payload)` arrivals into a gap-free ascending stream.
///
/// Cloning yields another handle to the same window, so the delivery
/// callback and the consuming tasks can share one buffer.
pub struct SequenceBuffer<T> {
    window: Arc<Mutex<Window<T>>>,
    policy: DuplicatePolicy,
}

impl<T> Clone for SequenceBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            window: Arc::clone(&self.window),
            policy: self.policy,
        }
    }
}

impl<T> fmt::Debug for SequenceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceBuffer")
            .field("state", &self.state())
            .field("buffered", &self.len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl<T> SequenceBuffer<T> {
    /// Create an empty, uninitialized buffer (last write wins on duplicates).
    pub fn new() -> Self {
        Self::with_policy(DuplicatePolicy::default())
    }

    /// Create an empty buffer with an explicit duplicate policy.
    pub fn with_policy(policy: DuplicatePolicy) -> Self {
        Self {
            window: Arc::new(Mutex::new(Window {
                cursor: None,
                entries: BTreeMap::new(),
                exhausted: false,
                initializing: false,
                consumed: false,
            })),
            policy,
        }
    }

    /// Returns the duplicate policy.
    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Buffer `payload` under `seq`.
    ///
    /// Fails with `StaleSequence` if the cursor is established and `seq` is
    /// below it; the buffer is left untouched in that case. Before
    /// initialization every sequence is accepted.
    pub fn add(&self, seq: u64, payload: T) -> Result<()> {
        let mut window = self.window.lock();

        match window.cursor {
            Some(cursor) if seq < cursor || window.exhausted => {
                debug!(seq, cursor, "stale sequence rejected");
                return Err(SeqOrderError::StaleSequence { seq, cursor });
            }
            _ => {}
        }

        match window.entries.entry(seq) {
            Entry::Vacant(slot) => {
                slot.insert(payload);
            }
            Entry::Occupied(mut slot) => match self.policy {
                DuplicatePolicy::LastWriteWins => {
                    slot.insert(payload);
                    debug!(seq, "buffered payload replaced by redelivery");
                }
                DuplicatePolicy::FirstWriteWins => {
                    debug!(seq, "redelivered payload ignored");
                }
            },
        }
        Ok(())
    }

    /// Fix the cursor to the smallest buffered sequence.
    ///
    /// Does nothing if the cursor is already set (the cursor never resets)
    /// or if the buffer is empty. Returns the cursor, if any.
    pub fn initialize(&self) -> Option<u64> {
        let mut window = self.window.lock();
        if window.cursor.is_none() {
            window.cursor = window.entries.keys().next().copied();
        }
        window.cursor
    }

    /// Pop the payload at the cursor and advance the cursor by one.
    ///
    /// Returns `None` if the buffer is not initialized or the next sequence
    /// has not arrived yet. After `u64::MAX` is emitted the cursor stays
    /// there and the buffer accepts nothing more.
    pub fn try_next(&self) -> Option<T> {
        let mut window = self.window.lock();
        if window.exhausted {
            return None;
        }
        let cursor = window.cursor?;
        let payload = window.entries.remove(&cursor)?;
        match cursor.checked_add(1) {
            Some(next) => window.cursor = Some(next),
            None => {
                window.exhausted = true;
                debug!(cursor, "sequence space exhausted");
            }
        }
        Some(payload)
    }

    /// Number of buffered, not yet emitted payloads.
    pub fn len(&self) -> usize {
        self.window.lock().entries.len()
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.window.lock().entries.is_empty()
    }

    /// The next sequence to emit, once initialized.
    pub fn cursor(&self) -> Option<u64> {
        self.window.lock().cursor
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BufferState {
        let window = self.window.lock();
        match window.cursor {
            Some(cursor) => BufferState::Active { cursor },
            None if window.initializing => BufferState::Initializing,
            None => BufferState::Uninitialized,
        }
    }

    /// Mark the buffer as consumed and its initializer as running.
    fn begin_consume(&self) -> Result<()> {
        let mut window = self.window.lock();
        if window.consumed {
            return Err(SeqOrderError::AlreadyConsuming);
        }
        window.consumed = true;
        window.initializing = window.cursor.is_none();
        Ok(())
    }

    /// Called by the initializer task when it exits.
    pub(crate) fn end_initializing(&self) {
        self.window.lock().initializing = false;
    }
}

impl<T> Default for SequenceBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> SequenceBuffer<T> {
    /// Start consuming: returns a stream of payloads in sequence order.
    ///
    /// `init_delay` is the window for early arrivals before the starting
    /// sequence is chosen; it is retried until the first item arrives.
    /// `poll_interval` is how often ready items are emitted. Background work
    /// stops when `shutdown` is cancelled or the stream is dropped.
    ///
    /// Must be called from within a tokio runtime. A buffer can be consumed
    /// only once.
    pub fn consume(
        &self,
        init_delay: Duration,
        poll_interval: Duration,
        shutdown: &CancellationToken,
    ) -> Result<OrderedStream<T>> {
        self.consume_with(
            ConsumeOptions {
                init_delay,
                poll_interval,
                ..ConsumeOptions::default()
            },
            shutdown,
        )
    }

    /// [`consume`](Self::consume) with every option spelled out.
    pub fn consume_with(
        &self,
        options: ConsumeOptions,
        shutdown: &CancellationToken,
    ) -> Result<OrderedStream<T>> {
        self.begin_consume()?;
        Ok(OrderedStream::spawn(self.clone(), options, shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_before_init_accepts_any_sequence() {
        let buf = SequenceBuffer::new();
        assert!(buf.is_empty());
        buf.add(123, "a").unwrap();
        buf.add(1, "b").unwrap();
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.state(), BufferState::Uninitialized);
    }

    #[test]
    fn initialize_picks_smallest_sequence() {
        let buf = SequenceBuffer::new();
        buf.add(100, "too big").unwrap();
        buf.add(1000, "way too big").unwrap();
        buf.add(10, "just right").unwrap();

        assert_eq!(buf.initialize(), Some(10));
        assert_eq!(buf.state(), BufferState::Active { cursor: 10 });
        assert_eq!(buf.try_next(), Some("just right"));
    }

    #[test]
    fn initialize_empty_stays_uninitialized() {
        let buf: SequenceBuffer<&str> = SequenceBuffer::new();
        assert_eq!(buf.initialize(), None);
        assert_eq!(buf.state(), BufferState::Uninitialized);
    }

    #[test]
    fn initialize_never_resets_cursor() {
        let buf = SequenceBuffer::new();
        buf.add(5, "5").unwrap();
        buf.initialize();
        buf.add(7, "7").unwrap();
        assert_eq!(buf.try_next(), Some("5"));
        assert_eq!(buf.initialize(), Some(6));
    }

    #[test]
    fn sequence_zero_is_a_valid_start() {
        let buf = SequenceBuffer::new();
        buf.add(1, "1").unwrap();
        buf.add(0, "0").unwrap();
        assert_eq!(buf.initialize(), Some(0));
        assert_eq!(buf.try_next(), Some("0"));
        assert_eq!(buf.try_next(), Some("1"));
    }

    #[test]
    fn stale_add_rejected_without_mutation() {
        let buf = SequenceBuffer::new();
        buf.add(5, "5").unwrap();
        buf.add(6, "6").unwrap();
        buf.initialize();

        let err = buf.add(1, "1").unwrap_err();
        assert!(matches!(err, SeqOrderError::StaleSequence { seq: 1, cursor: 5 }));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.cursor(), Some(5));
    }

    #[test]
    fn emitted_sequence_is_stale() {
        let buf = SequenceBuffer::new();
        buf.add(1, "1").unwrap();
        buf.initialize();
        assert_eq!(buf.try_next(), Some("1"));

        // Redelivery of an already-emitted message.
        assert!(buf.add(1, "1 again").is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn gap_blocks_emission_until_filled() {
        let buf = SequenceBuffer::new();
        buf.add(1, "1").unwrap();
        buf.add(2, "2").unwrap();
        buf.add(4, "4").unwrap();
        buf.initialize();

        assert_eq!(buf.try_next(), Some("1"));
        assert_eq!(buf.try_next(), Some("2"));
        assert_eq!(buf.try_next(), None);
        assert_eq!(buf.cursor(), Some(3));

        buf.add(3, "3").unwrap();
        assert_eq!(buf.try_next(), Some("3"));
        assert_eq!(buf.try_next(), Some("4"));
        assert_eq!(buf.try_next(), None);
    }

    #[test]
    fn try_next_before_init_returns_none() {
        let buf = SequenceBuffer::new();
        buf.add(1, "1").unwrap();
        assert_eq!(buf.try_next(), None);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn last_write_wins_by_default() {
        let buf = SequenceBuffer::new();
        buf.add(1, "first").unwrap();
        buf.add(1, "second").unwrap();
        assert_eq!(buf.len(), 1);
        buf.initialize();
        assert_eq!(buf.try_next(), Some("second"));
    }

    #[test]
    fn first_write_wins_when_configured() {
        let buf = SequenceBuffer::with_policy(DuplicatePolicy::FirstWriteWins);
        buf.add(1, "first").unwrap();
        buf.add(1, "second").unwrap();
        buf.initialize();
        assert_eq!(buf.try_next(), Some("first"));
    }

    #[test]
    fn clones_share_the_window() {
        let buf = SequenceBuffer::new();
        let handle = buf.clone();
        handle.add(9, "9").unwrap();
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.initialize(), Some(9));
        assert_eq!(handle.cursor(), Some(9));
    }

    #[test]
    fn emitting_the_last_sequence_exhausts_the_buffer() {
        let buf = SequenceBuffer::new();
        buf.add(u64::MAX - 1, "second to last").unwrap();
        buf.add(u64::MAX, "last").unwrap();
        buf.initialize();
        assert_eq!(buf.try_next(), Some("second to last"));
        assert_eq!(buf.try_next(), Some("last"));

        let err = buf.add(u64::MAX, "again").unwrap_err();
        assert!(matches!(
            err,
            SeqOrderError::StaleSequence { seq: u64::MAX, cursor: u64::MAX }
        ));
        assert!(buf.is_empty());
        assert_eq!(buf.try_next(), None);
        assert_eq!(buf.initialize(), Some(u64::MAX));
    }

    #[test]
    fn policy_serializes_snake_case() {
        let json = serde_json::to_string(&DuplicatePolicy::FirstWriteWins).unwrap();
        assert_eq!(json, "\"first_write_wins\"");
    }
}
