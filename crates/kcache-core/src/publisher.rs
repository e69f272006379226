// ── Publishers ──
//
// A publisher fans one ordered event source out to any number of
// subscriptions. It is the only writer to their queues and the only
// owner of the live set; subscribe and unsubscribe are serialized
// through its task. Delivery never blocks: a full queue drops the event.
//
// Every derived view (filter, clone, clone-with-filter) implements the
// same `Publisher` capability by wrapping its parent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::CacheReader;
use crate::error::CoreError;
use crate::event::Event;
use crate::filter::Filter;
use crate::signal::Signal;
use crate::subscription::{
    EventSource, FilterSubscription, Outlet, RefilterHandle, Subscription, SubscriptionId,
};

const REQUEST_CHANNEL_SIZE: usize = 16;

/// Capabilities shared by controllers and every view derived from them.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Read access to the cache behind this publisher.
    fn cache(&self) -> Arc<dyn CacheReader>;

    /// Fires once the cache holds its initial state.
    fn ready(&self) -> Signal;

    /// Fires once the publisher has shut down.
    fn done(&self) -> Signal;

    /// Shut down, closing every subscription. Idempotent.
    fn close(&self);

    /// New independent event queue.
    async fn subscribe(&self) -> Result<Subscription, CoreError>;

    /// New filtered view with its own cache.
    async fn subscribe_with_filter(&self, filter: Filter) -> Result<FilterSubscription, CoreError> {
        let sub = self.subscribe().await?;
        Ok(FilterSubscription::spawn(sub, filter, false))
    }

    /// New filtered view that stays not-ready until its first refilter.
    async fn subscribe_for_filter(&self) -> Result<FilterSubscription, CoreError> {
        let sub = self.subscribe().await?;
        Ok(FilterSubscription::spawn(sub, Filter::all(), true))
    }

    /// Independent publisher fed by a subscription to this one.
    async fn clone_controller(&self) -> Result<SubscriptionPublisher, CoreError> {
        let sub = self.subscribe().await?;
        let capacity = sub.capacity();
        Ok(SubscriptionPublisher::new(sub, capacity))
    }

    /// Independent publisher fed by a filtered view of this one.
    async fn clone_with_filter(&self, filter: Filter) -> Result<FilterPublisher, CoreError> {
        let view = self.subscribe_with_filter(filter).await?;
        Ok(FilterPublisher::new(view))
    }

    /// Like [`clone_with_filter`](Publisher::clone_with_filter), but not
    /// ready until the first refilter.
    async fn clone_for_filter(&self) -> Result<FilterPublisher, CoreError> {
        let view = self.subscribe_for_filter().await?;
        Ok(FilterPublisher::new(view))
    }
}

// ── SubscriptionPublisher ────────────────────────────────────────────

/// Publisher fed by an [`EventSource`].
///
/// Cheaply cloneable; clones share the same task.
#[derive(Clone)]
pub struct SubscriptionPublisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    requests: mpsc::Sender<oneshot::Sender<Subscription>>,
    cache: Arc<dyn CacheReader>,
    ready: Signal,
    cancel: CancellationToken,
    done: Signal,
}

impl SubscriptionPublisher {
    /// Start publishing `source` to subscriptions with queues of
    /// `capacity` events.
    ///
    /// Closing the publisher closes `source`; `source` ending closes
    /// the publisher.
    pub fn new(source: impl EventSource, capacity: usize) -> Self {
        let (requests, request_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let cancel = CancellationToken::new();
        let done = Signal::new();
        let cache = source.cache();
        let ready = source.ready();

        let task = PublisherTask {
            source: Box::new(source),
            capacity: capacity.max(1),
            cache: Arc::clone(&cache),
            ready: ready.clone(),
            cancel: cancel.clone(),
            outlets: HashMap::new(),
        };
        tokio::spawn(task.run(request_rx, done.clone()));

        Self {
            inner: Arc::new(PublisherInner {
                requests,
                cache,
                ready,
                cancel,
                done,
            }),
        }
    }
}

#[async_trait]
impl Publisher for SubscriptionPublisher {
    fn cache(&self) -> Arc<dyn CacheReader> {
        Arc::clone(&self.inner.cache)
    }

    fn ready(&self) -> Signal {
        self.inner.ready.clone()
    }

    fn done(&self) -> Signal {
        self.inner.done.clone()
    }

    fn close(&self) {
        self.inner.cancel.cancel();
    }

    async fn subscribe(&self) -> Result<Subscription, CoreError> {
        let cancel = &self.inner.cancel;
        if cancel.is_cancelled() {
            return Err(CoreError::NotRunning);
        }

        let (reply, rx) = oneshot::channel();
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CoreError::NotRunning),
            sent = self.inner.requests.send(reply) => sent.map_err(|_| CoreError::NotRunning)?,
        }
        rx.await.map_err(|_| CoreError::NotRunning)
    }
}

struct PublisherTask {
    source: Box<dyn EventSource>,
    capacity: usize,
    cache: Arc<dyn CacheReader>,
    ready: Signal,
    cancel: CancellationToken,
    outlets: HashMap<SubscriptionId, Outlet>,
}

impl PublisherTask {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<oneshot::Sender<Subscription>>,
        done: Signal,
    ) {
        let (unsubscribe_tx, mut unsubscribes) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                Some(id) = unsubscribes.recv() => {
                    self.outlets.remove(&id);
                }
                Some(reply) = requests.recv() => {
                    self.subscribe(reply, &unsubscribe_tx);
                }
                event = self.source.recv() => {
                    let Some(event) = event else { break };
                    self.distribute(&event);
                }
            }
        }

        self.cancel.cancel();
        self.source.close();
        self.outlets.clear();
        debug!("publisher stopped");
        drop(self);
        done.fire();
    }

    fn subscribe(
        &mut self,
        reply: oneshot::Sender<Subscription>,
        unsubscribe: &mpsc::UnboundedSender<SubscriptionId>,
    ) {
        let (outlet, inlet) = Outlet::channel(self.capacity);
        let id = outlet.id();
        let sub = Subscription::new(
            inlet,
            self.ready.clone(),
            Arc::clone(&self.cache),
            &self.cancel,
            Some(unsubscribe.clone()),
        );

        if reply.send(sub).is_ok() {
            debug!(subscription = %id, "subscribed");
            self.outlets.insert(id, outlet);
        }
    }

    fn distribute(&mut self, event: &Event) {
        self.outlets
            .retain(|_, outlet| outlet.offer(event.clone()));
    }
}

// ── FilterPublisher ──────────────────────────────────────────────────

/// Publisher fed by a [`FilterSubscription`], with live refiltering.
#[derive(Clone)]
pub struct FilterPublisher {
    refilter: RefilterHandle,
    publisher: SubscriptionPublisher,
}

impl FilterPublisher {
    pub(crate) fn new(view: FilterSubscription) -> Self {
        let refilter = view.refilter_handle();
        let capacity = view.capacity();
        Self {
            refilter,
            publisher: SubscriptionPublisher::new(view, capacity),
        }
    }

    /// Replace the filter of the underlying view.
    pub async fn refilter(&self, filter: Filter) -> Result<(), CoreError> {
        self.refilter.refilter(filter).await
    }
}

#[async_trait]
impl Publisher for FilterPublisher {
    fn cache(&self) -> Arc<dyn CacheReader> {
        self.publisher.cache()
    }

    fn ready(&self) -> Signal {
        self.publisher.ready()
    }

    fn done(&self) -> Signal {
        self.publisher.done()
    }

    fn close(&self) {
        self.publisher.close();
    }

    async fn subscribe(&self) -> Result<Subscription, CoreError> {
        self.publisher.subscribe().await
    }
}
