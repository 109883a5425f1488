use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

use parley_types::events::{ChatEvent, Topic};

use crate::filter::EventFilter;
use crate::session::Subscription;

/// Events a topic buffers for its slowest subscriber before that subscriber lags.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Topic-keyed fanout of chat events to live subscription sessions.
///
/// Cheap to clone; every clone shares the same registry. Each subscriber owns
/// its own receiver, so a slow or failing subscriber never holds up the
/// publisher or its peers. No history is kept: a session only sees events
/// published after it subscribed.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

struct EventBusInner {
    /// One channel per topic, created up front. The map is never mutated, so
    /// publish and subscribe only contend inside the channel itself.
    topics: HashMap<Topic, broadcast::Sender<ChatEvent>>,

    /// Cancelled on shutdown; every session token is a child of it.
    shutdown: CancellationToken,

    next_session_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let topics = Topic::ALL
            .iter()
            .map(|topic| (*topic, broadcast::channel(capacity.max(1)).0))
            .collect();

        Self {
            inner: Arc::new(EventBusInner {
                topics,
                shutdown: CancellationToken::new(),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<ChatEvent> {
        // Every topic is registered in `with_capacity`.
        &self.inner.topics[&topic]
    }

    /// Fan `event` out to every session currently subscribed to its topic.
    /// Returns once the event is queued for each of them; returns the number
    /// of sessions it was queued for.
    pub fn publish(&self, event: ChatEvent) -> usize {
        let topic = event.topic();
        if self.is_shut_down() {
            debug!("Dropping {} event for {}: bus is shut down", topic, event.conversation_id());
            return 0;
        }

        let conversation_id = event.conversation_id();
        // Err only means nobody is listening right now.
        let receivers = self.sender(topic).send(event).unwrap_or(0);
        trace!("Published {} for {} to {} sessions", topic, conversation_id, receivers);
        receivers
    }

    /// Open a session on `topic` that delivers only what `filter` admits.
    pub fn subscribe(&self, topic: Topic, caller: Option<Uuid>, filter: EventFilter) -> Subscription {
        let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.sender(topic).subscribe();
        let cancel = self.inner.shutdown.child_token();
        if self.is_shut_down() {
            // Opened after teardown: born closed.
            cancel.cancel();
        }
        debug!("Session {} opened on {} for {:?}", id, topic, caller);
        Subscription::new(id, topic, caller, filter, rx, cancel)
    }

    /// Sessions currently registered on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.sender(topic).receiver_count()
    }

    /// Close every live session and refuse further publishes. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("Event bus shutting down");
        }
        self.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once [`EventBus::shutdown`] has been called.
    pub async fn shut_down(&self) {
        self.inner.shutdown.cancelled().await
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
