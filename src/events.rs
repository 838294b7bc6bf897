//! Upstream notifications: fatal errors and fetch-failure reports.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::ShuffleError;

/// Tells the upstream coordinator that an output of a map attempt could not
/// be read, so it can decide whether to re-run that map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InputReadErrorEvent {
    pub diagnostics: String,
    pub input_index: u32,
    pub attempt_number: u32,
}

/// Receives everything the scheduler escalates.
///
/// Both methods are called while the scheduler holds its state lock, so an
/// implementation must not call back into the scheduler synchronously.
pub trait EventSink: Send + Sync + 'static {
    /// A fatal error. The owner of the run is expected to stop the shuffle.
    fn report_exception(&self, error: ShuffleError);

    fn send_events(&self, events: Vec<InputReadErrorEvent>);
}

#[derive(Debug)]
pub enum ShuffleEvent {
    Fatal(ShuffleError),
    ReadError(InputReadErrorEvent),
}

/// An [`EventSink`] forwarding everything into an unbounded channel.
#[derive(Clone, Debug)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<ShuffleEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ShuffleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn report_exception(&self, error: ShuffleError) {
        if let Err(mpsc::error::SendError(ShuffleEvent::Fatal(error))) =
            self.tx.send(ShuffleEvent::Fatal(error))
        {
            warn!(%error, "Fatal shuffle error dropped, nobody is listening");
        }
    }

    fn send_events(&self, events: Vec<InputReadErrorEvent>) {
        for event in events {
            if self.tx.send(ShuffleEvent::ReadError(event)).is_err() {
                warn!("Read error event dropped, nobody is listening");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelEventSink::new();
        sink.send_events(vec![InputReadErrorEvent {
            diagnostics: "boom".into(),
            input_index: 1,
            attempt_number: 0,
        }]);
        sink.report_exception(ShuffleError::Merge("full".into()));

        assert!(matches!(rx.try_recv(), Ok(ShuffleEvent::ReadError(e)) if e.input_index == 1));
        assert!(matches!(
            rx.try_recv(),
            Ok(ShuffleEvent::Fatal(ShuffleError::Merge(_)))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_channel_does_not_panic() {
        let (sink, rx) = ChannelEventSink::new();
        drop(rx);
        sink.report_exception(ShuffleError::Merge("nobody".into()));
    }
}
