//! Delivery-callback glue between a subscription and a `SequenceBuffer`.
//!
//! The transport's message handler calls `on_message_delivered` with the
//! message's sequence number and decoded payload; the returned
//! `Disposition` tells it whether to acknowledge. Stale arrivals are counted
//! and still acknowledged, since they were delivered before.
//!
//! With `buffer_messages` off the buffer is bypassed: payloads queue in
//! delivery order, duplicates and gaps included, and the stream returned by
//! `start` yields them as they are.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::buffer::SequenceBuffer;
use crate::config::ConsumerConfig;
use crate::error::{Result, SeqOrderError};
use crate::fault::FaultInjector;
use crate::stream::OrderedStream;

/// What the transport glue should do with a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled; acknowledge it.
    Ack,
    /// Dropped unhandled by fault injection; do not acknowledge.
    Drop,
    /// Handled, but the ack is withheld by fault injection.
    SkipAck,
}

/// Snapshot of subscription counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    /// Messages handled, regardless of acks.
    pub received: u64,
    /// Acks the transport accepted.
    pub acks_sent: u64,
    /// Acks withheld by fault injection or rejected by the transport.
    pub failed_acks: u64,
    /// Messages dropped unhandled by fault injection.
    pub dropped: u64,
    /// Messages rejected as older than the buffer cursor.
    pub stale: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    acks_sent: AtomicU64,
    failed_acks: AtomicU64,
    dropped: AtomicU64,
    stale: AtomicU64,
}

/// Delivery-order queue used when buffering is off.
struct Passthrough<T> {
    tx: mpsc::UnboundedSender<T>,
    /// Taken by `start`.
    rx: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
}

/// Feeds delivered messages into a sequence buffer and exposes the ordered
/// stream.
///
/// Cloning yields another handle to the same buffer and counters.
pub struct OrderedConsumer<T> {
    buffer: SequenceBuffer<T>,
    passthrough: Option<Arc<Passthrough<T>>>,
    faults: FaultInjector,
    config: ConsumerConfig,
    counters: Arc<Counters>,
}

impl<T> Clone for OrderedConsumer<T> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            passthrough: self.passthrough.clone(),
            faults: self.faults,
            config: self.config.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<T> OrderedConsumer<T> {
    /// Validate `config` and create a consumer with an empty buffer.
    pub fn new(config: ConsumerConfig) -> Result<Self> {
        config.validate()?;
        let passthrough = (!config.buffer_messages).then(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Passthrough {
                tx,
                rx: Mutex::new(Some(rx)),
            })
        });
        Ok(Self {
            buffer: SequenceBuffer::with_policy(config.duplicate_policy),
            passthrough,
            faults: config.fault_injector(),
            config,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Returns the consumer configuration.
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Returns the underlying sequence buffer. It stays empty when
    /// buffering is off.
    pub fn buffer(&self) -> &SequenceBuffer<T> {
        &self.buffer
    }

    /// Handle one delivered message.
    pub fn on_message_delivered(&self, seq: u64, payload: T) -> Disposition {
        // A dropped message is redelivered after the ack wait, out of sequence.
        if self.faults.should_drop() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(seq, "delivered message dropped by fault injection");
            return Disposition::Drop;
        }

        self.counters.received.fetch_add(1, Ordering::Relaxed);

        match &self.passthrough {
            Some(passthrough) => {
                if passthrough.tx.send(payload).is_err() {
                    debug!(seq, "stream closed; delivery discarded");
                }
            }
            None => {
                if let Err(SeqOrderError::StaleSequence { seq, cursor }) = self.buffer.add(seq, payload) {
                    self.counters.stale.fetch_add(1, Ordering::Relaxed);
                    debug!(seq, cursor, subject = %self.config.subject, "stale delivery counted");
                }
            }
        }

        // A withheld ack makes the transport redeliver a duplicate.
        if self.faults.should_fail_ack() {
            self.counters.failed_acks.fetch_add(1, Ordering::Relaxed);
            debug!(seq, "ack withheld by fault injection");
            return Disposition::SkipAck;
        }

        Disposition::Ack
    }

    /// Record the outcome of acknowledging a message with the transport.
    pub fn record_ack(&self, accepted: bool) {
        if accepted {
            self.counters.acks_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed_acks.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current subscription counters.
    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.counters.received.load(Ordering::Relaxed),
            acks_sent: self.counters.acks_sent.load(Ordering::Relaxed),
            failed_acks: self.counters.failed_acks.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
        }
    }
}

impl<T: Send + 'static> OrderedConsumer<T> {
    /// Start consumption with the configured timing: ordered through the
    /// buffer, or in delivery order when buffering is off.
    ///
    /// Must be called from within a tokio runtime; can be called once.
    pub fn start(&self, shutdown: &CancellationToken) -> Result<OrderedStream<T>> {
        match &self.passthrough {
            Some(passthrough) => {
                let rx = passthrough
                    .rx
                    .lock()
                    .take()
                    .ok_or(SeqOrderError::AlreadyConsuming)?;
                Ok(OrderedStream::passthrough(rx, self.config.channel_capacity, shutdown))
            }
            None => self
                .buffer
                .consume_with(self.config.consume_options(), shutdown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> ConsumerConfig {
        ConsumerConfig::from_json(json).unwrap()
    }

    #[test]
    fn delivered_messages_are_buffered_and_acked() {
        let consumer = OrderedConsumer::new(ConsumerConfig::default()).unwrap();
        assert_eq!(consumer.on_message_delivered(2, "b"), Disposition::Ack);
        assert_eq!(consumer.on_message_delivered(1, "a"), Disposition::Ack);
        consumer.record_ack(true);
        consumer.record_ack(true);

        assert_eq!(consumer.buffer().len(), 2);
        let stats = consumer.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.acks_sent, 2);
        assert_eq!(stats.stale, 0);
    }

    #[test]
    fn stale_delivery_counted_and_still_acked() {
        let consumer = OrderedConsumer::new(ConsumerConfig::default()).unwrap();
        consumer.on_message_delivered(5, "5");
        consumer.buffer().initialize();

        assert_eq!(consumer.on_message_delivered(3, "3"), Disposition::Ack);
        assert_eq!(consumer.stats().stale, 1);
        assert_eq!(consumer.buffer().len(), 1);
    }

    #[test]
    fn full_drop_ratio_drops_everything() {
        let consumer = OrderedConsumer::new(config(r#"{"msg_drop_ratio": 1.0}"#)).unwrap();
        for seq in 0..10 {
            assert_eq!(consumer.on_message_delivered(seq, seq), Disposition::Drop);
        }
        assert!(consumer.buffer().is_empty());
        let stats = consumer.stats();
        assert_eq!(stats.dropped, 10);
        assert_eq!(stats.received, 0);
    }

    #[test]
    fn full_ack_fail_ratio_withholds_acks() {
        let consumer = OrderedConsumer::new(config(r#"{"ack_fail_ratio": 1.0}"#)).unwrap();
        assert_eq!(consumer.on_message_delivered(1, "a"), Disposition::SkipAck);
        assert_eq!(consumer.buffer().len(), 1);
        let stats = consumer.stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.failed_acks, 1);
    }

    #[test]
    fn rejected_ack_counts_as_failure() {
        let consumer: OrderedConsumer<u8> = OrderedConsumer::new(ConsumerConfig::default()).unwrap();
        consumer.record_ack(false);
        assert_eq!(consumer.stats().failed_acks, 1);
    }

    #[test]
    fn invalid_config_rejected() {
        let bad = ConsumerConfig {
            poll_interval_ms: 0,
            ..ConsumerConfig::default()
        };
        assert!(OrderedConsumer::<u8>::new(bad).is_err());
    }

    #[test]
    fn unbuffered_deliveries_bypass_the_buffer() {
        let consumer = OrderedConsumer::new(config(r#"{"buffer_messages": false}"#)).unwrap();
        assert_eq!(consumer.on_message_delivered(2, "b"), Disposition::Ack);
        assert_eq!(consumer.on_message_delivered(1, "a"), Disposition::Ack);
        assert!(consumer.buffer().is_empty());
        assert_eq!(consumer.stats().received, 2);
    }

    #[tokio::test]
    async fn unbuffered_start_twice_is_rejected() {
        let consumer: OrderedConsumer<u8> =
            OrderedConsumer::new(config(r#"{"buffer_messages": false}"#)).unwrap();
        let shutdown = CancellationToken::new();
        let _stream = consumer.start(&shutdown).unwrap();
        assert!(matches!(
            consumer.start(&shutdown),
            Err(SeqOrderError::AlreadyConsuming)
        ));
    }

    #[test]
    fn clones_share_counters() {
        let consumer = OrderedConsumer::new(ConsumerConfig::default()).unwrap();
        let handler = consumer.clone();
        handler.on_message_delivered(1, "a");
        assert_eq!(consumer.stats().received, 1);
        assert_eq!(consumer.buffer().len(), 1);
    }
}
