//! The fan-in stream of change events consumed by the coordinator.
use std::time::Duration;

use tokio::sync::mpsc;

use tributary_events::ChangeEvent;

/// Receiving side of the fan-in channel.
///
/// The stream distinguishes "no events right now" ([`RecvTimeout::TimedOut`])
/// from "every source has terminated" ([`RecvTimeout::Closed`]); the stream
/// is never silently closed.
pub struct EventStream {
    receiver: mpsc::Receiver<ChangeEvent>,
}

impl EventStream {
    pub(crate) fn new(receiver: mpsc::Receiver<ChangeEvent>) -> EventStream {
        EventStream { receiver }
    }

    /// Wait for the next event; `None` once every source has terminated.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    /// Wait for the next event, up to `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> RecvTimeout {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(event)) => RecvTimeout::Event(event),
            Ok(None) => RecvTimeout::Closed,
            Err(_) => RecvTimeout::TimedOut,
        }
    }
}

/// Outcome of a bounded wait on the event stream.
#[derive(Debug)]
pub enum RecvTimeout {
    /// An event arrived.
    Event(ChangeEvent),
    /// Every source has terminated; no further events will arrive.
    Closed,
    /// No event arrived within the bound; the stream remains open.
    TimedOut,
}
