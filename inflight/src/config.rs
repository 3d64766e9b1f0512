//! Producer-side configuration.
//!
//! Every field has a default; a partial JSON document is merged over the
//! defaults once, at construction time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{InflightError, Result};

/// Default subject published to.
pub const DEFAULT_SUBJECT: &str = "ascii";
/// Default producer client id.
pub const DEFAULT_CLIENT_ID: &str = "ascii-producer";
/// Default bound on waiting for outstanding acks at shutdown: 60 s.
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 60_000;
/// Default interval between pending-set checks: 5 ms.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;
/// Default cap on publishes awaiting acknowledgement.
pub const DEFAULT_MAX_INFLIGHT: usize = 16_384;

/// Configuration for a [`DrainablePublisher`](crate::DrainablePublisher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Subject messages are published on.
    pub subject: String,
    /// Client id presented to the transport.
    pub client_id: String,
    /// How long `shutdown` waits for outstanding acks, in milliseconds.
    pub drain_timeout_ms: u64,
    /// Interval between pending-set checks while draining, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of publishes awaiting acknowledgement. Further
    /// publishes are refused until acks bring the count back under it.
    pub max_inflight: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            subject: DEFAULT_SUBJECT.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_inflight: DEFAULT_MAX_INFLIGHT,
        }
    }
}

impl ProducerConfig {
    /// Parse a (possibly partial) JSON document, filling unset fields with
    /// defaults, and validate the result.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the tracker cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.subject.is_empty() {
            return Err(InflightError::InvalidConfig("subject must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(InflightError::InvalidConfig(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.max_inflight == 0 {
            return Err(InflightError::InvalidConfig(
                "max_inflight must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Drain bound as a `Duration`.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ProducerConfig::default();
        assert_eq!(config.subject, "ascii");
        assert_eq!(config.drain_timeout(), Duration::from_secs(60));
        assert_eq!(config.poll_interval(), Duration::from_millis(5));
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_merges_over_defaults() {
        let config = ProducerConfig::from_json(r#"{"drain_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.drain_timeout(), Duration::from_millis(250));
        assert_eq!(config.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(config.max_inflight, DEFAULT_MAX_INFLIGHT);
    }

    #[test]
    fn zero_drain_timeout_is_allowed() {
        let config = ProducerConfig::from_json(r#"{"drain_timeout_ms": 0}"#).unwrap();
        assert_eq!(config.drain_timeout(), Duration::ZERO);
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let err = ProducerConfig::from_json(r#"{"poll_interval_ms": 0}"#).unwrap_err();
        assert!(matches!(err, InflightError::InvalidConfig(_)));
    }

    #[test]
    fn malformed_json_rejected() {
        let err = ProducerConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, InflightError::Config(_)));
    }
}
