//! # Bus Events
//!
//! Lifecycle and error notifications the bus broadcasts to its owner.
//! Composed from a `tokio::sync::broadcast` channel rather than an
//! event-emitter base type; every call to [`Bus::events`] gets an
//! independent receiver.
//!
//! [`Bus::events`]: crate::Bus::events

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::broadcast;
use tokio_stream::Stream;
use tracing::debug;

/// Notifications emitted by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// The connection pipeline completed and the bus is ready.
    Connected,
    /// The transport was torn down; a reconnect may follow.
    Disconnected,
    /// A recoverable failure: validation, transport, or payload decode.
    Error(String),
}

/// A stream wrapper over the event channel.
///
/// Implements `tokio_stream::Stream` for use with stream combinators.
/// A receiver that falls behind skips the overwritten events.
pub struct EventStream {
    receiver: broadcast::Receiver<BusEvent>,
}

impl EventStream {
    /// Wrap a broadcast receiver.
    #[must_use]
    pub fn new(receiver: broadcast::Receiver<BusEvent>) -> Self {
        Self { receiver }
    }
}

impl Stream for EventStream {
    type Item = BusEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Poll::Ready(Some(event)),
                Err(broadcast::error::TryRecvError::Empty) => {
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                Err(broadcast::error::TryRecvError::Closed) => return Poll::Ready(None),
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    debug!(lagged = count, "event stream lagged, events skipped");
                    continue;
                }
            }
        }
    }
}
