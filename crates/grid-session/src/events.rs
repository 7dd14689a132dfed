//! Session lifecycle events.
//!
//! The repository publishes a [`SessionEvent`] on its [`SessionEventBus`]
//! whenever a session is created, changed, deleted or expires. Each event is
//! delivered at most once per subscriber; a delete or expiration racing with
//! another removal of the same session yields a single event.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;

use crate::record::SessionId;

/// A lifecycle change of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { id: SessionId },
    /// Attributes under `keys` were set or removed.
    Changed { id: SessionId, keys: Vec<String> },
    Deleted { id: SessionId },
    Expired { id: SessionId },
}

impl SessionEvent {
    /// The session this event is about.
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionEvent::Created { id }
            | SessionEvent::Changed { id, .. }
            | SessionEvent::Deleted { id }
            | SessionEvent::Expired { id } => id,
        }
    }

    /// Lowercase event name, for logs and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Created { .. } => "created",
            SessionEvent::Changed { .. } => "changed",
            SessionEvent::Deleted { .. } => "deleted",
            SessionEvent::Expired { .. } => "expired",
        }
    }
}

/// Receives session events synchronously on the publishing task.
pub trait SessionEventListener: Send + Sync {
    fn on_event(&self, event: &SessionEvent);

    /// Whether the listener can no longer receive anything. Closed listeners
    /// are unsubscribed on the next publish.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Handle for removing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct ChannelListener(mpsc::UnboundedSender<SessionEvent>);

impl SessionEventListener for ChannelListener {
    fn on_event(&self, event: &SessionEvent) {
        // Receiver dropped; pruned after this publish.
        let _ = self.0.send(event.clone());
    }

    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

#[derive(Default)]
struct BusInner {
    listeners: RwLock<Vec<(SubscriptionId, Arc<dyn SessionEventListener>)>>,
    next_id: AtomicU64,
}

/// Fan-out of session events to subscribers. Cloning shares the subscriber list.
#[derive(Clone, Default)]
pub struct SessionEventBus {
    inner: Arc<BusInner>,
}

impl SessionEventBus {
    /// An empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback subscriber.
    pub fn subscribe(&self, listener: Arc<dyn SessionEventListener>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, listener));
        id
    }

    /// Subscribe with a channel instead of a callback.
    ///
    /// Dropping the receiver ends the subscription.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.subscribe(Arc::new(ChannelListener(tx))), rx)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    /// Number of live subscriptions.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Deliver `event` to every subscriber, in subscription order.
    pub fn publish(&self, event: SessionEvent) {
        let listeners: Vec<Arc<dyn SessionEventListener>> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        trace!(
            session_id = %event.session_id(),
            kind = event.kind(),
            listeners = listeners.len(),
            "Publishing session event"
        );
        let mut closed = false;
        for listener in &listeners {
            listener.on_event(&event);
            closed |= listener.is_closed();
        }
        if closed {
            let mut subscribed = self.inner.listeners.write();
            subscribed.retain(|(_, l)| !l.is_closed());
            trace!(listeners = subscribed.len(), "Dropped closed subscriptions");
        }
    }
}

impl std::fmt::Debug for SessionEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<SessionEvent>>);

    impl SessionEventListener for Collect {
        fn on_event(&self, event: &SessionEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let bus = SessionEventBus::new();
        let a = Arc::new(Collect::default());
        let b = Arc::new(Collect::default());
        bus.subscribe(a.clone());
        let b_id = bus.subscribe(b.clone());

        bus.publish(SessionEvent::Created { id: "s".into() });
        assert!(bus.unsubscribe(b_id));
        bus.publish(SessionEvent::Deleted { id: "s".into() });

        assert_eq!(a.0.lock().len(), 2);
        assert_eq!(b.0.lock().len(), 1);
        assert_eq!(bus.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let bus = SessionEventBus::new();
        let (_, mut rx) = bus.subscribe_channel();

        bus.publish(SessionEvent::Changed {
            id: "s".into(),
            keys: vec!["a".into()],
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "changed");
        assert_eq!(event.session_id().as_str(), "s");

        drop(rx);
        // A dropped receiver does not break publishing.
        bus.publish(SessionEvent::Expired { id: "s".into() });
    }

    #[test]
    fn test_dropped_channel_is_unsubscribed() {
        let bus = SessionEventBus::new();
        let kept = Arc::new(Collect::default());
        bus.subscribe(kept.clone());
        let (_, rx) = bus.subscribe_channel();
        assert_eq!(bus.listener_count(), 2);

        drop(rx);
        bus.publish(SessionEvent::Created { id: "s".into() });
        assert_eq!(bus.listener_count(), 1);
        assert_eq!(kept.0.lock().len(), 1);
    }

    #[test]
    fn test_clones_share_subscribers() {
        let bus = SessionEventBus::new();
        let other = bus.clone();
        other.subscribe(Arc::new(Collect::default()));
        assert_eq!(bus.listener_count(), 1);
    }
}
