//! SeqOrder -- in-order delivery on top of an at-least-once transport.
//!
//! The transport may deliver a series out of order, duplicated, or with
//! gaps (network loss, redelivery after an ack timeout, injected faults).
//! A `SequenceBuffer` holds arrivals keyed by their transport sequence
//! number and re-emits them as a contiguous, strictly increasing stream:
//! - **SequenceBuffer**: the sequence window and its cursor
//! - **OrderedStream**: the consuming side, fed by background initializer
//!   and drainer tasks that stop on an explicit cancellation token
//! - **OrderedConsumer**: delivery-callback glue with fault injection and
//!   per-subscription statistics

pub mod buffer;
pub mod config;
pub mod consumer;
pub mod error;
pub mod fault;
pub mod stream;

// Re-export key public types at crate root.
pub use buffer::{BufferState, DuplicatePolicy, SequenceBuffer};
pub use config::ConsumerConfig;
pub use consumer::{ConsumerStats, Disposition, OrderedConsumer};
pub use error::{Result, SeqOrderError};
pub use fault::FaultInjector;
pub use stream::{ConsumeOptions, OrderedStream};
pub use tokio_util::sync::CancellationToken;
