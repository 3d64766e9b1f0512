//! Consumer-side configuration.
//!
//! Every field has a default; a partial JSON document is merged over the
//! defaults once, at construction time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::DuplicatePolicy;
use crate::error::{Result, SeqOrderError};
use crate::fault::FaultInjector;
use crate::stream::ConsumeOptions;

/// Default subject subscribed to.
pub const DEFAULT_SUBJECT: &str = "ascii";
/// Default consumer client id.
pub const DEFAULT_CLIENT_ID: &str = "ascii-consumer";
/// Default initialization window: 3 s.
pub const DEFAULT_INIT_DELAY_MS: u64 = 3_000;
/// Default drainer period: 1 ms.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1;

/// Configuration for an [`OrderedConsumer`](crate::OrderedConsumer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Subject messages are delivered from.
    pub subject: String,
    /// Client id presented to the transport.
    pub client_id: String,
    /// Window for early arrivals before the starting sequence is chosen.
    pub init_delay_ms: u64,
    /// Drainer period.
    pub poll_interval_ms: u64,
    /// Reorder deliveries through a sequence buffer. When off, payloads are
    /// handed to the stream in delivery order.
    pub buffer_messages: bool,
    /// Payloads held by the ordered stream before the drainer waits.
    pub channel_capacity: usize,
    /// Re-run initialization while the buffer is empty.
    pub retry_init: bool,
    /// Handling of a second payload for an unemitted sequence.
    pub duplicate_policy: DuplicatePolicy,
    /// Probability of dropping a delivered message unhandled.
    pub msg_drop_ratio: f64,
    /// Probability of withholding the ack for a handled message.
    pub ack_fail_ratio: f64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            subject: DEFAULT_SUBJECT.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            init_delay_ms: DEFAULT_INIT_DELAY_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            buffer_messages: true,
            channel_capacity: 1,
            retry_init: true,
            duplicate_policy: DuplicatePolicy::LastWriteWins,
            msg_drop_ratio: 0.0,
            ack_fail_ratio: 0.0,
        }
    }
}

impl ConsumerConfig {
    /// Parse a (possibly partial) JSON document, filling unset fields with
    /// defaults, and validate the result.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the buffer tasks cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.subject.is_empty() {
            return Err(SeqOrderError::InvalidConfig("subject must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(SeqOrderError::InvalidConfig(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(SeqOrderError::InvalidConfig(
                "channel_capacity must be greater than zero".into(),
            ));
        }
        for (name, ratio) in [
            ("msg_drop_ratio", self.msg_drop_ratio),
            ("ack_fail_ratio", self.ack_fail_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(SeqOrderError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {ratio}"
                )));
            }
        }
        Ok(())
    }

    /// Initialization window as a `Duration`.
    pub fn init_delay(&self) -> Duration {
        Duration::from_millis(self.init_delay_ms)
    }

    /// Drainer period as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Options for `SequenceBuffer::consume_with`.
    pub fn consume_options(&self) -> ConsumeOptions {
        ConsumeOptions {
            init_delay: self.init_delay(),
            poll_interval: self.poll_interval(),
            channel_capacity: self.channel_capacity,
            retry_init: self.retry_init,
        }
    }

    /// Fault injector built from the configured ratios.
    pub fn fault_injector(&self) -> FaultInjector {
        FaultInjector::new(self.msg_drop_ratio, self.ack_fail_ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.init_delay(), Duration::from_secs(3));
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
        assert!(config.retry_init);
        assert!(config.buffer_messages);
        assert!(config.fault_injector().is_disabled());
        config.validate().unwrap();
    }

    #[test]
    fn defaults_match_consume_options() {
        assert_eq!(ConsumerConfig::default().consume_options(), ConsumeOptions::default());
    }

    #[test]
    fn partial_json_merges_over_defaults() {
        let config = ConsumerConfig::from_json(
            r#"{"init_delay_ms": 50, "duplicate_policy": "first_write_wins", "msg_drop_ratio": 0.1}"#,
        )
        .unwrap();
        assert_eq!(config.init_delay(), Duration::from_millis(50));
        assert_eq!(config.duplicate_policy, DuplicatePolicy::FirstWriteWins);
        assert_eq!(config.fault_injector().drop_ratio(), 0.1);
        assert_eq!(config.subject, DEFAULT_SUBJECT);
    }

    #[test]
    fn buffering_can_be_switched_off() {
        let config = ConsumerConfig::from_json(r#"{"buffer_messages": false}"#).unwrap();
        assert!(!config.buffer_messages);
    }

    #[test]
    fn out_of_range_ratio_rejected() {
        let err = ConsumerConfig::from_json(r#"{"ack_fail_ratio": 1.5}"#).unwrap_err();
        assert!(matches!(err, SeqOrderError::InvalidConfig(_)));
    }

    #[test]
    fn zero_capacity_rejected() {
        let err = ConsumerConfig::from_json(r#"{"channel_capacity": 0}"#).unwrap_err();
        assert!(matches!(err, SeqOrderError::InvalidConfig(_)));
    }

    #[test]
    fn unknown_policy_rejected() {
        let err = ConsumerConfig::from_json(r#"{"duplicate_policy": "newest"}"#).unwrap_err();
        assert!(matches!(err, SeqOrderError::Config(_)));
    }
}
