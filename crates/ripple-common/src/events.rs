use tokio::sync::broadcast;

/// Fan-out of cloneable events to any number of subscribers.
///
/// Slow subscribers lag rather than block the publisher; publishing with no
/// subscribers is not an error.
pub struct EventBus<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: T) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Ping {
        A,
        B(u32),
    }

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(Ping::A);

        let event = rx.recv().await.unwrap();
        assert_eq!(event, Ping::A);
    }

    #[tokio::test]
    async fn multiple_subscribers() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(Ping::B(7));

        assert_eq!(rx1.recv().await.unwrap(), Ping::B(7));
        assert_eq!(rx2.recv().await.unwrap(), Ping::B(7));
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        for i in 0..3 {
            bus.publish(Ping::B(i));
        }

        for i in 0..3 {
            assert_eq!(rx.recv().await.unwrap(), Ping::B(i));
        }
    }

    #[test]
    fn publish_returns_zero_with_no_subscribers() {
        let bus: EventBus<Ping> = EventBus::new(16);
        assert_eq!(bus.publish(Ping::A), 0);
    }

    #[tokio::test]
    async fn clones_share_subscribers() {
        let bus = EventBus::new(16);
        let other = bus.clone();
        let _rx1 = bus.subscribe();
        let _rx2 = other.subscribe();

        assert_eq!(bus.subscriber_count(), 2);
        assert_eq!(other.publish(Ping::A), 2);
    }
}
