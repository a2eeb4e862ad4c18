//! Event bus for messages between services.

use anyhow::Result;
use tokio::sync::broadcast;

use crate::status::ControlState;

/// Application events.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A fan configuration document changed on disk.
    ConfigChangeDetected { name: String },
    ControlStateChanged {
        from: ControlState,
        to: ControlState,
    },
    /// Fan `fan` exceeded the retry threshold and left curve control.
    FaultFallback { fan: usize, automatic: bool },
    SystemShutdown,
}

/// Publish-subscribe channel shared by all services.
///
/// # Example
///
/// ```no_run
/// use nbfcd::event::{Event, EventBus};
///
/// let event_bus = EventBus::new();
/// let mut subscriber = event_bus.subscribe();
/// event_bus.publish(Event::SystemShutdown)?;
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns an error if there are no active subscribers.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.sender.send(event)?;
        Ok(())
    }

    /// Publishes without caring whether anyone listens.
    pub fn notify(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
