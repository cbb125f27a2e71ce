//! Event publishing
//!
//! `EventPublisher` is a typed, explicitly constructed broadcast channel.
//! Owners pass clones of it to the components that publish or subscribe;
//! there is no process-wide registry.

use tokio::sync::broadcast;

/// Default buffered events per subscriber before it starts lagging
pub const DEFAULT_EVENT_CAPACITY: usize = 16384;

/// Fire-and-forget publisher for one event type.
#[derive(Debug)]
pub struct EventPublisher<E> {
    sender: broadcast::Sender<E>,
}

impl<E> Clone for EventPublisher<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventPublisher<E> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl<E: Clone + Send + 'static> EventPublisher<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to every current subscriber.
    ///
    /// Never blocks. Returns the number of subscribers that will see the event;
    /// zero subscribers is not an error.
    pub fn publish(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let publisher = EventPublisher::<String>::new(4);
        assert_eq!(publisher.publish("nobody".to_string()), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let publisher = EventPublisher::<u32>::new(4);
        let mut a = publisher.subscribe();
        let mut b = publisher.clone().subscribe();

        assert_eq!(publisher.publish(7), 2);
        assert_eq!(a.recv().await.unwrap(), 7);
        assert_eq!(b.recv().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_told() {
        let publisher = EventPublisher::<u32>::new(2);
        let mut rx = publisher.subscribe();
        for i in 0..5 {
            publisher.publish(i);
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap(), 3);
    }
}
