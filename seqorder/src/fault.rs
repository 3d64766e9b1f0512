//! Fault injection for exercising redelivery paths.
//!
//! Each delivered message is independently dropped with probability
//! `drop_ratio` (never handled nor acked, so the transport redelivers it
//! after its ack wait, out of sequence) and, once handled, has its ack
//! withheld with probability `ack_fail_ratio` (so the transport redelivers a
//! duplicate). Ratios are clamped to [0.0, 1.0]; a ratio of 0.0 never fires.

/// Probability-based drop and ack-failure decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultInjector {
    drop_ratio: f64,
    ack_fail_ratio: f64,
}

impl FaultInjector {
    /// Create an injector with the given ratios, each clamped to [0.0, 1.0].
    pub fn new(drop_ratio: f64, ack_fail_ratio: f64) -> Self {
        Self {
            drop_ratio: clamp_ratio(drop_ratio),
            ack_fail_ratio: clamp_ratio(ack_fail_ratio),
        }
    }

    /// An injector that never injects anything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Returns the configured drop ratio.
    pub fn drop_ratio(&self) -> f64 {
        self.drop_ratio
    }

    /// Returns the configured ack-failure ratio.
    pub fn ack_fail_ratio(&self) -> f64 {
        self.ack_fail_ratio
    }

    /// Returns `true` if no fault can ever fire.
    pub fn is_disabled(&self) -> bool {
        self.drop_ratio == 0.0 && self.ack_fail_ratio == 0.0
    }

    /// Decide whether to drop the current message.
    pub fn should_drop(&self) -> bool {
        roll(self.drop_ratio)
    }

    /// Decide whether to withhold the current message's ack.
    pub fn should_fail_ack(&self) -> bool {
        roll(self.ack_fail_ratio)
    }
}

fn clamp_ratio(ratio: f64) -> f64 {
    if ratio.is_nan() {
        0.0
    } else {
        ratio.clamp(0.0, 1.0)
    }
}

fn roll(ratio: f64) -> bool {
    ratio > 0.0 && rand::random::<f64>() < ratio
}
