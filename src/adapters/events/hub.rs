use tokio::sync::broadcast;

/// Fan-out of events to any number of subscribers.
///
/// Publishing never blocks and never fails the publisher: with no subscribers
/// the event is dropped, and slow subscribers observe `Lagged`.
#[derive(Debug, Clone)]
pub struct EventHub<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventHub<E> {
    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

impl<E: Clone> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}
