//! Per-consumer event queues.
//!
//! A [`Subscription`] is the consumer end of one bounded queue filled by
//! a publisher, plus read access to the publisher's cache and readiness.
//! The publisher never blocks on a subscription: when the queue is full
//! the event is dropped, logged, and counted in
//! [`Subscription::dropped_events`]. A consumer that sees the count move
//! can resynchronize from `cache().list()`.
//!
//! [`FilterSubscription`] derives a filtered view with its own cache.

mod filter;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_core::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use self::filter::FilterSubscription;
pub(crate) use self::filter::RefilterHandle;
use crate::cache::CacheReader;
use crate::event::Event;
use crate::signal::Signal;

/// Anything a publisher can be fed from.
///
/// Implemented by [`Subscription`] and [`FilterSubscription`], which is
/// what lets publishers chain: subscribe, filter, clone, filter again.
#[async_trait]
pub trait EventSource: Send + 'static {
    /// Read access to the cache backing this source.
    fn cache(&self) -> Arc<dyn CacheReader>;

    /// Fires once the cache holds its initial state.
    fn ready(&self) -> Signal;

    /// Fires once the source is closed.
    fn done(&self) -> Signal;

    /// Next event, in order. `None` once the source is closed.
    async fn recv(&mut self) -> Option<Event>;

    /// Stop the source. Idempotent.
    fn close(&self);
}

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Publisher-side end of a bounded, lossy event queue.
pub(crate) struct Outlet {
    id: SubscriptionId,
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl Outlet {
    /// Bounded queue pair with shared drop accounting.
    pub(crate) fn channel(capacity: usize) -> (Self, Inlet) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let id = SubscriptionId::next();
        let outlet = Self {
            id,
            tx,
            dropped: Arc::clone(&dropped),
        };
        let inlet = Inlet {
            id,
            rx,
            dropped,
            capacity: capacity.max(1),
        };
        (outlet, inlet)
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Enqueue, waiting for room. Returns `false` once the consumer is gone.
    pub(crate) async fn send(&self, event: Event) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Enqueue without waiting. Returns `false` once the consumer is gone.
    pub(crate) fn offer(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    subscription = %self.id,
                    event = %event,
                    dropped = total,
                    "subscription buffer full; event dropped"
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Consumer-side end of an [`Outlet`].
pub(crate) struct Inlet {
    id: SubscriptionId,
    rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

/// An ordered, bounded event feed plus a view of its publisher's cache.
///
/// Dropping a subscription closes it.
pub struct Subscription {
    id: SubscriptionId,
    events: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
    capacity: usize,

    ready: Signal,
    cache: Arc<dyn CacheReader>,

    cancel: CancellationToken,
    unsubscribe: Option<mpsc::UnboundedSender<SubscriptionId>>,
}

impl Subscription {
    /// Wrap the consumer end of a queue.
    ///
    /// `unsubscribe` is told this subscription's id when it closes.
    pub(crate) fn new(
        inlet: Inlet,
        ready: Signal,
        cache: Arc<dyn CacheReader>,
        parent: &CancellationToken,
        unsubscribe: Option<mpsc::UnboundedSender<SubscriptionId>>,
    ) -> Self {
        Self {
            id: inlet.id,
            events: inlet.rx,
            dropped: inlet.dropped,
            capacity: inlet.capacity,
            ready,
            cache,
            cancel: parent.child_token(),
            unsubscribe,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Read access to the publisher's cache.
    pub fn cache(&self) -> Arc<dyn CacheReader> {
        Arc::clone(&self.cache)
    }

    pub fn ready(&self) -> Signal {
        self.ready.clone()
    }

    pub fn done(&self) -> Signal {
        Signal::from_token(self.cancel.clone())
    }

    /// Next event. `None` once the subscription or its publisher closed.
    pub async fn recv(&mut self) -> Option<Event> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Events dropped so far because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop this subscription only. Idempotent.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if let Some(unsubscribe) = &self.unsubscribe {
            let _ = unsubscribe.send(self.id);
        }
    }

    /// Consume the subscription as a [`Stream`] of events.
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + 'static {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("ready", &self.ready.is_fired())
            .field("closed", &self.cancel.is_cancelled())
            .field("dropped", &self.dropped_events())
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl EventSource for Subscription {
    fn cache(&self) -> Arc<dyn CacheReader> {
        Subscription::cache(self)
    }

    fn ready(&self) -> Signal {
        Subscription::ready(self)
    }

    fn done(&self) -> Signal {
        Subscription::done(self)
    }

    async fn recv(&mut self) -> Option<Event> {
        Subscription::recv(self).await
    }

    fn close(&self) {
        Subscription::close(self);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::cache::Cache;
    use crate::event::EventType;
    use crate::filter::Filter;
    use crate::testutil::{assert_done, gen_event};

    fn subscription(
        capacity: usize,
    ) -> (
        Outlet,
        Subscription,
        mpsc::UnboundedReceiver<SubscriptionId>,
        CancellationToken,
    ) {
        let token = CancellationToken::new();
        let cache = Cache::spawn(&token, Filter::null());
        let (outlet, inlet) = Outlet::channel(capacity);
        let (unsub_tx, unsub_rx) = mpsc::unbounded_channel();
        let sub = Subscription::new(inlet, Signal::new(), Arc::new(cache), &token, Some(unsub_tx));
        (outlet, sub, unsub_rx, token)
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let (outlet, mut sub, _unsub, _token) = subscription(8);
        for v in ["1", "2", "3"] {
            assert!(outlet.offer(gen_event(EventType::Update, "a", "x", v)));
        }
        for v in ["1", "2", "3"] {
            assert_eq!(sub.recv().await.unwrap().object.resource_version(), v);
        }
    }

    #[tokio::test]
    async fn overflow_drops_and_counts() {
        let (outlet, mut sub, _unsub, _token) = subscription(2);
        for v in 1..=5 {
            assert!(outlet.offer(gen_event(EventType::Update, "a", "x", &v.to_string())));
        }
        assert_eq!(sub.dropped_events(), 3);

        assert_eq!(sub.recv().await.unwrap().object.resource_version(), "1");
        assert_eq!(sub.recv().await.unwrap().object.resource_version(), "2");

        // Keeps working once drained.
        assert!(outlet.offer(gen_event(EventType::Update, "a", "x", "6")));
        assert_eq!(sub.recv().await.unwrap().object.resource_version(), "6");
    }

    #[tokio::test]
    async fn close_unsubscribes_once() {
        let (outlet, mut sub, mut unsub, _token) = subscription(2);
        let id = sub.id();

        sub.close();
        sub.close();
        assert_done(&sub.done()).await;
        assert!(sub.recv().await.is_none());

        assert_eq!(unsub.recv().await, Some(id));
        drop(sub);
        assert!(unsub.try_recv().is_err());

        assert!(!outlet.offer(gen_event(EventType::Create, "a", "x", "1")));
    }

    #[tokio::test]
    async fn parent_cancel_closes() {
        let (_outlet, mut sub, _unsub, token) = subscription(2);
        token.cancel();
        assert_done(&sub.done()).await;
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn into_stream_ends_with_publisher() {
        let (outlet, sub, _unsub, _token) = subscription(4);
        outlet.offer(gen_event(EventType::Create, "a", "x", "1"));
        outlet.offer(gen_event(EventType::Delete, "a", "x", "1"));
        drop(outlet);

        let kinds: Vec<EventType> = sub.into_stream().map(|e| e.kind).collect().await;
        assert_eq!(kinds, vec![EventType::Create, EventType::Delete]);
    }

    #[test]
    fn ids_are_unique() {
        let a = SubscriptionId::next();
        let b = SubscriptionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("sub-"));
    }
}
