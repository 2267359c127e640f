//! Coordination signals exchanged between the poller, the streamer, the repository and the
//! client.
//!
//! The bus is a `tokio::sync::broadcast` channel: publishing never waits for subscribers, and
//! each subscriber drains its own queue on its own task. A subscriber that falls too far behind
//! observes `RecvError::Lagged` and skips ahead; it never slows down the publisher.
use tokio::sync::broadcast;

use crate::Error;

/// Event vocabulary of the SDK.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SdkEvent {
    /// The poller has completed its first successful refresh.
    PollerReady,
    /// A poll cycle failed.
    PollerError(Error),
    /// The stream connection is established; the poller is paused.
    StreamConnected,
    /// The stream is about to reconnect (attempt number); the poller is resumed.
    StreamRetrying(u32),
    /// The stream connection ended.
    StreamDisconnected,
    /// The stream failed to connect or broke.
    StreamError(Error),
    /// The metrics processor has started.
    MetricsReady,
    /// A flag definition was stored.
    FlagStored(String),
    /// A flag definition was deleted.
    FlagDeleted(String),
    /// A segment definition was stored.
    SegmentStored(String),
    /// A segment definition was deleted.
    SegmentDeleted(String),
    /// The flag with this identifier changed, directly or through a segment it depends on.
    Changed(String),
}

/// Publish/subscribe channel for [`SdkEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SdkEvent>,
}

impl EventBus {
    /// Default number of events buffered per subscriber.
    pub const DEFAULT_CAPACITY: usize = 4096;

    /// Create a new bus with [`EventBus::DEFAULT_CAPACITY`].
    pub fn new() -> EventBus {
        EventBus::with_capacity(EventBus::DEFAULT_CAPACITY)
    }

    /// Create a new bus buffering up to `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> EventBus {
        let (sender, _) = broadcast::channel(capacity);
        EventBus { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: SdkEvent) {
        log::trace!(target: "ff", event:? = event; "publishing event");
        // Error only means there are no subscribers at the moment.
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}
