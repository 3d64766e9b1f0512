//! The consuming side of a `SequenceBuffer`.
//!
//! `OrderedStream::spawn` starts two tokio tasks that share the buffer:
//! - the **initializer** fires once `init_delay` has elapsed and fixes the
//!   cursor to the smallest buffered sequence. If the buffer is still empty
//!   it tries again every `init_delay` (or gives up when `retry_init` is
//!   off, leaving the buffer uninitialized);
//! - the **drainer** wakes every `poll_interval` and hands every contiguous
//!   ready payload to the stream, stopping at the first gap.
//!
//! The drainer reserves a channel slot before popping, so a payload leaves
//! the buffer only when the stream can take it. Both tasks exit when the
//! stream's cancellation token fires: on the caller's shutdown token, on
//! `stop`, or when the stream is dropped.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::SequenceBuffer;

/// Floor for both task periods; tokio intervals cannot tick at zero.
const MIN_TICK: Duration = Duration::from_millis(1);

/// Timing and hand-off settings for a consuming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Window for early arrivals before the starting sequence is chosen.
    pub init_delay: Duration,
    /// How often contiguous ready payloads are emitted.
    pub poll_interval: Duration,
    /// Payloads the stream holds before the drainer waits for the reader.
    pub channel_capacity: usize,
    /// Keep re-running the initializer while the buffer is empty.
    pub retry_init: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            init_delay: Duration::from_secs(3),
            poll_interval: Duration::from_millis(1),
            channel_capacity: 1,
            retry_init: true,
        }
    }
}

/// Payloads of one consuming session, in strictly increasing sequence order
/// (or in delivery order for an unbuffered consumer).
///
/// Implements `Stream`; `recv` and `blocking_recv` are available for callers
/// that prefer a channel-style API. The stream never ends on its own while a
/// gap persists; it ends after the session is stopped.
pub struct OrderedStream<T> {
    rx: mpsc::Receiver<T>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> OrderedStream<T> {
    pub(crate) fn spawn(
        buffer: SequenceBuffer<T>,
        options: ConsumeOptions,
        shutdown: &CancellationToken,
    ) -> Self {
        let token = shutdown.child_token();
        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));

        let initializer = tokio::spawn(run_initializer(
            buffer.clone(),
            options.init_delay,
            options.retry_init,
            token.clone(),
        ));
        let drainer = tokio::spawn(run_drainer(
            buffer,
            options.poll_interval,
            tx,
            token.clone(),
        ));

        Self {
            rx,
            token,
            tasks: vec![initializer, drainer],
        }
    }
}

impl<T: Send + 'static> OrderedStream<T> {
    /// Hand payloads from `source` to the stream as they come, without
    /// reordering. Used when a consumer runs unbuffered.
    pub(crate) fn passthrough(
        source: mpsc::UnboundedReceiver<T>,
        channel_capacity: usize,
        shutdown: &CancellationToken,
    ) -> Self {
        let token = shutdown.child_token();
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let forwarder = tokio::spawn(run_forwarder(source, tx, token.clone()));

        Self {
            rx,
            token,
            tasks: vec![forwarder],
        }
    }
}

impl<T> OrderedStream<T> {
    /// Wait for the next payload. Returns `None` once the session is stopped
    /// and everything already handed over has been read.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next payload if one is ready.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Blocking variant of [`recv`](Self::recv) for synchronous readers.
    ///
    /// Panics if called from within an async execution context.
    pub fn blocking_recv(&mut self) -> Option<T> {
        self.rx.blocking_recv()
    }

    /// Signal the background tasks to stop. Idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Returns `true` once the session has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop the session and wait for both background tasks to exit.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "ordered stream task failed");
            }
        }
    }
}

impl<T> fmt::Debug for OrderedStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedStream")
            .field("stopped", &self.is_stopped())
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl<T> Stream for OrderedStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for OrderedStream<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run_initializer<T>(
    buffer: SequenceBuffer<T>,
    init_delay: Duration,
    retry: bool,
    token: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + init_delay, init_delay.max(MIN_TICK));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Some(cursor) = buffer.initialize() {
                    info!(cursor, buffered = buffer.len(), "sequence buffer initialized");
                    break;
                }
                if !retry {
                    warn!(
                        init_delay_ms = init_delay.as_millis() as u64,
                        "initialization window elapsed on an empty buffer; staying uninitialized"
                    );
                    break;
                }
            }
        }
    }

    buffer.end_initializing();
}

async fn run_drainer<T>(
    buffer: SequenceBuffer<T>,
    poll_interval: Duration,
    tx: mpsc::Sender<T>,
    token: CancellationToken,
) {
    let mut ticker = time::interval(poll_interval.max(MIN_TICK));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    'session: loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break 'session,
            _ = ticker.tick() => {}
        }

        // Emit as many contiguous payloads as are ready, then wait.
        loop {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => break 'session,
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        debug!("ordered stream dropped; drainer exiting");
                        break 'session;
                    }
                },
            };

            match buffer.try_next() {
                Some(payload) => permit.send(payload),
                None => break,
            }
        }
    }

    debug!(cursor = ?buffer.cursor(), buffered = buffer.len(), "sequence drainer stopped");
}

async fn run_forwarder<T>(
    mut source: mpsc::UnboundedReceiver<T>,
    tx: mpsc::Sender<T>,
    token: CancellationToken,
) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            payload = source.recv() => match payload {
                Some(payload) => permit.send(payload),
                None => break,
            },
        }
    }

    debug!("delivery forwarder stopped");
}
