// ── Filter subscriptions ──
//
// A filtered view over a parent subscription. It owns a cache bound to
// its current filter, seeded from the parent's full snapshot once the
// parent is ready and kept current by applying parent events through
// that cache. A refilter re-syncs from a fresh parent snapshot, so the
// view is correct after arbitrary filter changes.
//
// A deferred view stays not-ready, and silent, until its first refilter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{EventSource, Outlet, Subscription, SubscriptionId};
use crate::cache::{Cache, CacheReader};
use crate::error::CoreError;
use crate::event::Event;
use crate::filter::Filter;
use crate::signal::Signal;

/// Sends refilter requests to a running filter view.
#[derive(Clone)]
pub(crate) struct RefilterHandle {
    tx: mpsc::Sender<Filter>,
    done: Signal,
}

impl RefilterHandle {
    pub(crate) async fn refilter(&self, filter: Filter) -> Result<(), CoreError> {
        tokio::select! {
            biased;
            () = self.done.wait() => Err(CoreError::NotRunning),
            sent = self.tx.send(filter) => sent.map_err(|_| CoreError::NotRunning),
        }
    }
}

/// A subscription whose events and cache are restricted by a [`Filter`].
pub struct FilterSubscription {
    id: SubscriptionId,
    events: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
    capacity: usize,

    ready: Signal,
    cache: Cache,
    refilter: RefilterHandle,

    cancel: CancellationToken,
    done: Signal,
}

impl FilterSubscription {
    /// Layer a filtered view over `parent`.
    ///
    /// With `defer_ready` the view waits for its first [`refilter`] before
    /// becoming ready.
    ///
    /// [`refilter`]: FilterSubscription::refilter
    pub(crate) fn spawn(parent: Subscription, filter: Filter, defer_ready: bool) -> Self {
        let capacity = parent.capacity();
        let (outlet, inlet) = Outlet::channel(capacity);
        let (refilter_tx, refilter_rx) = mpsc::channel(1);

        let cancel = CancellationToken::new();
        let cache = Cache::spawn(&cancel, filter.clone());
        let ready = Signal::new();
        let done = Signal::new();

        let task = FilterTask {
            parent,
            cache: cache.clone(),
            filter,
            defer_ready,
            ready: ready.clone(),
            out: outlet,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run(refilter_rx, done.clone()));

        Self {
            id: inlet.id,
            events: inlet.rx,
            dropped: inlet.dropped,
            capacity,
            ready,
            cache,
            refilter: RefilterHandle {
                tx: refilter_tx,
                done: done.clone(),
            },
            cancel,
            done,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Read access to this view's filtered cache.
    pub fn cache(&self) -> Arc<dyn CacheReader> {
        Arc::new(self.cache.clone())
    }

    pub fn ready(&self) -> Signal {
        self.ready.clone()
    }

    pub fn done(&self) -> Signal {
        self.done.clone()
    }

    /// Next event. `None` once the view or its parent closed.
    pub async fn recv(&mut self) -> Option<Event> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Replace the filter.
    ///
    /// Objects leaving the view are reported as deletes, objects entering
    /// it as creates. A filter equal to the current one changes nothing.
    pub async fn refilter(&self, filter: Filter) -> Result<(), CoreError> {
        self.refilter.refilter(filter).await
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close this view and the parent subscription it owns. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn refilter_handle(&self) -> RefilterHandle {
        self.refilter.clone()
    }
}

impl Drop for FilterSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl EventSource for FilterSubscription {
    fn cache(&self) -> Arc<dyn CacheReader> {
        FilterSubscription::cache(self)
    }

    fn ready(&self) -> Signal {
        FilterSubscription::ready(self)
    }

    fn done(&self) -> Signal {
        FilterSubscription::done(self)
    }

    async fn recv(&mut self) -> Option<Event> {
        FilterSubscription::recv(self).await
    }

    fn close(&self) {
        FilterSubscription::close(self);
    }
}

// ── Task ─────────────────────────────────────────────────────────────

struct FilterTask {
    parent: Subscription,
    cache: Cache,
    filter: Filter,
    defer_ready: bool,
    ready: Signal,
    out: Outlet,
    cancel: CancellationToken,
}

impl FilterTask {
    async fn run(mut self, mut refilters: mpsc::Receiver<Filter>, done: Signal) {
        if let Err(e) = self.process(&mut refilters).await {
            debug!(subscription = %self.out.id(), error = %e, "filter subscription stopping");
        }

        self.cancel.cancel();
        self.cache.stop();
        self.parent.close();
        let cache_done = self.cache.done();
        drop(self);
        cache_done.wait().await;
        done.fire();
    }

    async fn process(&mut self, refilters: &mut mpsc::Receiver<Filter>) -> Result<(), CoreError> {
        let parent_ready = self.parent.ready();
        let mut parent_is_ready = false;
        let mut pending = false;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(()),

                () = parent_ready.wait(), if !parent_is_ready => {
                    parent_is_ready = true;
                    if self.defer_ready && !pending {
                        continue;
                    }
                    let list = self.parent.cache().list().await?;
                    self.cache.sync(list).await?;
                    self.ready.fire();
                }

                Some(filter) = refilters.recv() => {
                    self.apply_refilter(filter, parent_is_ready, &mut pending).await?;
                }

                event = self.parent.recv() => {
                    let Some(event) = event else { return Ok(()) };
                    if !self.ready.is_fired() {
                        continue;
                    }
                    for event in self.cache.update(event).await? {
                        if !self.out.offer(event) {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn apply_refilter(
        &mut self,
        filter: Filter,
        parent_is_ready: bool,
        pending: &mut bool,
    ) -> Result<(), CoreError> {
        let is_new = filter != self.filter;

        if !parent_is_ready {
            // Remember the request; the initial sync happens once the
            // parent is ready.
            if is_new {
                self.cache.refilter(None, filter.clone()).await?;
                self.filter = filter;
            }
            *pending = true;
            return Ok(());
        }

        let was_ready = self.ready.is_fired();
        if was_ready && !is_new {
            return Ok(());
        }

        let list = self.parent.cache().list().await?;
        let events = if is_new {
            let events = self.cache.refilter(Some(list), filter.clone()).await?;
            self.filter = filter;
            events
        } else {
            self.cache.sync(list).await?
        };

        if !was_ready {
            self.ready.fire();
            return Ok(());
        }

        for event in events {
            if !self.out.offer(event) {
                break;
            }
        }
        Ok(())
    }
}
