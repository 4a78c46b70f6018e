use std::path::PathBuf;

use tokio::sync::broadcast;
use tracing::info;

use crate::registry::PeerRecord;

/// Capacity of the event channel. Slow subscribers miss the oldest events
/// instead of stalling the engine.
pub const EVENT_CAPACITY: usize = 256;

/// Events emitted by the engine for the CLI / UI to observe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShareEvent {
    /// A remote device opened a connection to our server.
    PeerConnected { address: String, port: u16 },
    /// A connection served by our server was closed.
    PeerDisconnected { address: String, port: u16 },
    /// Discovery saw a device offering the service for the first time.
    PeerFound(PeerRecord),
    /// A peer was removed from the registry.
    PeerLost(PeerRecord),
    /// A download completed and was written to `path`.
    FileReceived {
        filename: String,
        address: String,
        path: PathBuf,
    },
    /// A free-text line meant for the user.
    Log { message: String },
}

/// Non-blocking fan-out of [`ShareEvent`]s.
///
/// Cloning is cheap; every clone publishes on the same channel. Sending
/// never waits: with no subscriber the event is dropped.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: broadcast::Sender<ShareEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

impl EventSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns a receiver that sees every event emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ShareEvent) {
        let _ = self.tx.send(event);
    }

    /// Publishes a user-facing log line and mirrors it to tracing.
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "driftshare::log", "{message}");
        self.emit(ShareEvent::Log { message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn when_log_emitted_expect_subscriber_receives_line() {
        let sink = EventSink::default();
        let mut rx = sink.subscribe();
        sink.log("hello");
        assert_eq!(
            rx.recv().await.unwrap(),
            ShareEvent::Log {
                message: "hello".into()
            }
        );
    }

    #[test]
    fn when_no_subscriber_expect_emit_does_not_panic() {
        let sink = EventSink::new(4);
        for _ in 0..10 {
            sink.emit(ShareEvent::PeerConnected {
                address: "10.0.0.1".into(),
                port: 1,
            });
        }
    }

    #[tokio::test]
    async fn when_subscriber_lags_expect_lagged_instead_of_blocking() {
        let sink = EventSink::new(2);
        let mut rx = sink.subscribe();
        for i in 0..5 {
            sink.log(format!("line {i}"));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
