use std::fmt::Debug;
use tokio::sync::broadcast;
use tracing::trace;


/// Publishes lifecycle events to any number of subscribers. Events are not buffered for
///  subscribers that join later.
pub struct EventNotifier<E> {
    sender: broadcast::Sender<E>,
}
impl <E: Clone + Debug> EventNotifier<E> {
    pub fn new() -> EventNotifier<E> {
        let (sender, _) = broadcast::channel(128);

        EventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: E) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
impl <E: Clone + Debug> Default for EventNotifier<E> {
    fn default() -> Self {
        EventNotifier::new()
    }
}
