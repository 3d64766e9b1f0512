//! Inflight -- acknowledgement tracking for asynchronous publishers.
//!
//! An at-least-once transport acknowledges asynchronous sends some time after
//! they are accepted. This crate keeps the set of sends still awaiting an
//! acknowledgement so a process can wait (with a bound) for that set to drain
//! before it releases its connection:
//! - **AckTracker**: the pending-id set with a blocking or async bounded drain
//! - **DrainablePublisher**: wraps a `Transport` so every accepted send is
//!   tracked and every acknowledgement untracks it

pub mod config;
pub mod error;
pub mod publisher;
pub mod tracker;

// Re-export key public types at crate root.
pub use config::ProducerConfig;
pub use error::{InflightError, Result};
pub use publisher::{AckError, AckFailure, AckHandler, DrainablePublisher, PublishStats, Transport};
pub use tracker::AckTracker;
