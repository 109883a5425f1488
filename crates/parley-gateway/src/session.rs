use std::panic::AssertUnwindSafe;

use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use parley_types::events::{ChatEvent, Topic};

use crate::filter::EventFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Holding a live bus registration
    Active,
    /// Registration released; nothing more will be delivered
    Closed,
}

/// One client's subscription to one topic.
///
/// Yields every event published on the topic after the session opened that
/// its filter admits, until it is closed, its closer fires, or the bus shuts
/// down.
pub struct Subscription {
    id: u64,
    topic: Topic,
    caller: Option<Uuid>,
    filter: EventFilter,
    rx: Option<broadcast::Receiver<ChatEvent>>,
    cancel: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        topic: Topic,
        caller: Option<Uuid>,
        filter: EventFilter,
        rx: broadcast::Receiver<ChatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            topic,
            caller,
            filter,
            rx: Some(rx),
            cancel,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn state(&self) -> SessionState {
        if self.rx.is_some() && !self.cancel.is_cancelled() {
            SessionState::Active
        } else {
            SessionState::Closed
        }
    }

    /// A handle that closes this session from another task.
    pub fn closer(&self) -> SessionCloser {
        SessionCloser {
            token: self.cancel.clone(),
        }
    }

    /// Idempotent.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.release();
    }

    fn release(&mut self) {
        if self.rx.take().is_some() {
            debug!("Session {} on {} closed", self.id, self.topic);
        }
    }

    /// Next admitted event, or `None` once the session is closed.
    pub async fn next(&mut self) -> Option<ChatEvent> {
        loop {
            let received = {
                let rx = self.rx.as_mut()?;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    result = rx.recv() => Some(result),
                }
            };

            let event = match received {
                None => {
                    self.release();
                    return None;
                }
                Some(Ok(event)) => event,
                Some(Err(RecvError::Lagged(n))) => {
                    warn!("Session {} on {} lagged by {} events", self.id, self.topic, n);
                    continue;
                }
                Some(Err(RecvError::Closed)) => {
                    self.release();
                    return None;
                }
            };

            // A close that raced the receive wins.
            if self.cancel.is_cancelled() {
                self.release();
                return None;
            }

            match self.filter.admits(&event) {
                Ok(true) => return Some(event),
                Ok(false) => {
                    trace!(
                        "Session {} dropped {} for {}",
                        self.id,
                        self.topic,
                        event.conversation_id()
                    );
                }
                Err(e) => {
                    warn!(
                        "Session {} on {} ({:?}) skipped event for {}: {}",
                        self.id,
                        self.topic,
                        self.caller,
                        event.conversation_id(),
                        e
                    );
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ChatEvent> + Send {
        let mut session = self;
        async_stream::stream! {
            while let Some(event) = session.next().await {
                yield event;
            }
        }
    }
}

/// Closes a [`Subscription`] from outside the task that drives it.
#[derive(Debug, Clone)]
pub struct SessionCloser {
    token: CancellationToken,
}

impl SessionCloser {
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A session driven by its own task, handing admitted events to `deliver`.
///
/// A panic inside `deliver` is logged and costs only the event being
/// delivered. Dropping the handle closes the session.
pub struct SessionHandle {
    topic: Topic,
    closer: SessionCloser,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// `deliver` returns `false` once its consumer is gone, which ends the session.
    pub fn spawn<F>(session: Subscription, mut deliver: F) -> Self
    where
        F: FnMut(ChatEvent) -> bool + Send + 'static,
    {
        let topic = session.topic();
        let id = session.id();
        let closer = session.closer();
        let task_closer = closer.clone();

        let task = tokio::spawn(async move {
            let mut events = Box::pin(session.into_stream());
            while let Some(event) = events.next().await {
                if task_closer.is_closed() {
                    break;
                }
                match std::panic::catch_unwind(AssertUnwindSafe(|| deliver(event))) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(_) => error!("Session {} on {}: delivery panicked, event dropped", id, topic),
                }
            }
            task_closer.close();
        });

        Self {
            topic,
            closer,
            task: Some(task),
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn closer(&self) -> SessionCloser {
        self.closer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// Close and wait for the driving task to stop. Once this returns,
    /// `deliver` is never called again.
    pub async fn close(mut self) {
        self.closer.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Session task on {} failed to stop cleanly: {}", self.topic, e);
            }
        }
        info!("Session on {} closed", self.topic);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.closer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::fixtures;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn session_for(bus: &EventBus, caller: Option<Uuid>) -> Subscription {
        bus.subscribe(Topic::ConversationUpdated, caller, EventFilter::Participant { caller })
    }

    #[tokio::test]
    async fn session_drops_events_for_non_participants() {
        let bus = EventBus::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut as_a = session_for(&bus, Some(a));
        let mut as_c = session_for(&bus, Some(c));

        let visible = fixtures::updated(&[a, b]);
        bus.publish(visible.clone());
        let for_c = fixtures::updated(&[b, c]);
        bus.publish(for_c.clone());

        assert_eq!(as_a.next().await, Some(visible));
        assert_eq!(as_c.next().await, Some(for_c));
    }

    #[tokio::test]
    async fn authorization_failure_skips_event_but_keeps_stream() {
        let bus = EventBus::new();
        let a = Uuid::new_v4();
        let mut anonymous = session_for(&bus, None);

        bus.publish(fixtures::updated(&[a]));
        let closer = anonymous.closer();
        let pending = tokio::time::timeout(Duration::from_millis(50), anonymous.next()).await;
        assert!(pending.is_err(), "anonymous session must not receive the event");
        assert_eq!(anonymous.state(), SessionState::Active);

        closer.close();
        assert_eq!(anonymous.next().await, None);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_registration() {
        let bus = EventBus::new();
        let mut session = session_for(&bus, Some(Uuid::new_v4()));
        assert_eq!(session.state(), SessionState::Active);

        session.close();
        session.close();

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(bus.subscriber_count(Topic::ConversationUpdated), 0);
        assert_eq!(session.next().await, None);
    }

    #[tokio::test]
    async fn queued_events_are_not_delivered_after_close() {
        let bus = EventBus::new();
        let a = Uuid::new_v4();
        let mut session = session_for(&bus, Some(a));

        bus.publish(fixtures::updated(&[a]));
        session.closer().close();

        assert_eq!(session.next().await, None);
    }

    #[tokio::test]
    async fn closer_wakes_a_waiting_session() {
        let bus = EventBus::new();
        let mut session = session_for(&bus, Some(Uuid::new_v4()));
        let closer = session.closer();

        let waiter = tokio::spawn(async move { session.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        closer.close();

        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn no_delivery_after_close_under_concurrent_publish() {
        let bus = EventBus::new();
        let a = Uuid::new_v4();
        let delivered = Arc::new(AtomicUsize::new(0));

        let counter = delivered.clone();
        let handle = SessionHandle::spawn(session_for(&bus, Some(a)), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        let publisher_bus = bus.clone();
        let publisher = tokio::spawn(async move {
            for _ in 0..2_000 {
                publisher_bus.publish(fixtures::updated(&[a]));
                tokio::task::yield_now().await;
            }
        });

        while delivered.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        handle.close().await;
        let at_close = delivered.load(Ordering::SeqCst);

        publisher.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), at_close);
    }

    #[tokio::test]
    async fn panicking_delivery_is_isolated() {
        let bus = EventBus::new();
        let a = Uuid::new_v4();
        let calls = Arc::new(AtomicUsize::new(0));
        let healthy = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let _faulty = SessionHandle::spawn(session_for(&bus, Some(a)), move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("subscriber blew up");
            }
            true
        });
        let counter = healthy.clone();
        let _healthy = SessionHandle::spawn(session_for(&bus, Some(a)), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        bus.publish(fixtures::updated(&[a]));
        bus.publish(fixtures::updated(&[a]));

        tokio::time::timeout(Duration::from_secs(1), async {
            while calls.load(Ordering::SeqCst) < 2 || healthy.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("both sessions keep receiving");
    }

    #[tokio::test]
    async fn dropping_handle_closes_session() {
        let bus = EventBus::new();
        let handle = SessionHandle::spawn(session_for(&bus, Some(Uuid::new_v4())), |_| true);
        let closer = handle.closer();

        drop(handle);
        assert!(closer.is_closed());
    }

    #[tokio::test]
    async fn stream_yields_admitted_events() {
        let bus = EventBus::new();
        let a = Uuid::new_v4();
        let session = session_for(&bus, Some(a));
        let closer = session.closer();
        let mut stream = Box::pin(session.into_stream());

        let event = fixtures::updated(&[a]);
        bus.publish(fixtures::updated(&[Uuid::new_v4()]));
        bus.publish(event.clone());

        assert_eq!(stream.next().await, Some(event));
        closer.close();
        assert_eq!(stream.next().await, None);
    }
}
