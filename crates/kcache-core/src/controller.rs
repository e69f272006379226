// ── Controller ──
//
// One synchronization pipeline: a lister, a watcher and a cache driven
// by a single loop, with a publisher fanning the cache's diff events out
// to subscribers.
//
// The loop alternates between list snapshots (sync, then re-point the
// watch at the snapshot's version) and watch events (update). A list
// failure is fatal: the controller shuts down and every subscriber sees
// its stream close. Transient watch failures never reach this layer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::{Cache, CacheReader};
use crate::client::Client;
use crate::config::ControllerConfig;
use crate::error::CoreError;
use crate::event::Event;
use crate::filter::Filter;
use crate::lister::Lister;
use crate::object::ObjectList;
use crate::publisher::{Publisher, SubscriptionPublisher};
use crate::signal::Signal;
use crate::subscription::{Outlet, Subscription};
use crate::watch::Watcher;

// ── ControllerState ──────────────────────────────────────────────

/// Lifecycle state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ControllerState {
    /// Waiting for the first successful list.
    Initializing,
    /// Initial state is cached and distributed.
    Ready,
    Closed,
}

// ── Builder ──────────────────────────────────────────────────────

/// Builder for [`Controller`].
#[derive(Default)]
pub struct ControllerBuilder {
    client: Option<Arc<dyn Client>>,
    config: ControllerConfig,
    cancel: Option<CancellationToken>,
}

impl ControllerBuilder {
    pub fn client(mut self, client: Arc<dyn Client>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Parent lifetime token. Cancelling it closes the controller.
    pub fn cancel_token(mut self, token: &CancellationToken) -> Self {
        self.cancel = Some(token.child_token());
        self
    }

    /// Start the controller. Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<Controller, CoreError> {
        let client = self.client.ok_or_else(|| CoreError::Config {
            message: "controller requires a client".into(),
        })?;
        if self.config.subscription_buffer_size == 0 || self.config.watch_buffer_size == 0 {
            return Err(CoreError::Config {
                message: "buffer sizes must be non-zero".into(),
            });
        }
        let cancel = self.cancel.unwrap_or_default();
        Ok(Controller::start(client, self.config, cancel))
    }
}

// ── Controller ───────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<ControllerInner>`; clones share the same
/// pipeline. Implements [`Publisher`] for subscribing and deriving views.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    cache: Arc<dyn CacheReader>,
    ready: Signal,
    done: Signal,
    cancel: CancellationToken,
    state: watch::Receiver<ControllerState>,
    refresh: mpsc::Sender<()>,
    publisher: SubscriptionPublisher,
}

impl Controller {
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::default()
    }

    /// Start a controller with default configuration, closed when
    /// `token` is cancelled.
    pub fn new(token: &CancellationToken, client: Arc<dyn Client>) -> Result<Self, CoreError> {
        Self::builder().client(client).cancel_token(token).build()
    }

    fn start(client: Arc<dyn Client>, config: ControllerConfig, cancel: CancellationToken) -> Self {
        let ready = Signal::new();
        let done = Signal::new();
        let (state_tx, state) = watch::channel(ControllerState::Initializing);

        let cache = Cache::spawn(&cancel, Filter::null());
        let reader: Arc<dyn CacheReader> = Arc::new(cache.clone());

        let lister = Lister::spawn(Arc::clone(&client), config.refresh_period, &cancel);
        let refresh = lister.refresh_handle();
        let watcher = Watcher::spawn(
            client,
            config.reconnect.clone(),
            config.watch_buffer_size,
            &cancel,
        );

        // The loop feeds a root subscription; the publisher fans it out.
        let capacity = config.subscription_buffer_size;
        let (feed, inlet) = Outlet::channel(capacity);
        let root = Subscription::new(inlet, ready.clone(), Arc::clone(&reader), &cancel, None);
        let publisher = SubscriptionPublisher::new(root, capacity);

        let task = ControllerTask {
            lister,
            watcher,
            cache,
            feed,
            ready: ready.clone(),
            state: state_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run(publisher.done(), done.clone()));

        Self {
            inner: Arc::new(ControllerInner {
                cache: reader,
                ready,
                done,
                cancel,
                state,
                refresh,
                publisher,
            }),
        }
    }

    /// Observable lifecycle state.
    pub fn state(&self) -> watch::Receiver<ControllerState> {
        self.inner.state.clone()
    }

    /// Ask for a relist now instead of at the next refresh period.
    ///
    /// Requests made while one is already pending are coalesced.
    pub fn refresh(&self) -> Result<(), CoreError> {
        match self.inner.refresh.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(CoreError::NotRunning),
        }
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("state", &*self.inner.state.borrow())
            .field("ready", &self.inner.ready.is_fired())
            .field("closed", &self.inner.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Publisher for Controller {
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
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::NotRunning);
        }
        self.inner.publisher.subscribe().await
    }
}

// ── Background loop ──────────────────────────────────────────────

struct ControllerTask {
    lister: Lister,
    watcher: Watcher,
    cache: Cache,
    feed: Outlet,
    ready: Signal,
    state: watch::Sender<ControllerState>,
    cancel: CancellationToken,
}

impl ControllerTask {
    async fn run(mut self, publisher_done: Signal, done: Signal) {
        match self.process().await {
            Ok(()) => debug!("controller closing"),
            Err(e) if e.is_not_running() => debug!("controller closing; pipeline stopped"),
            Err(e) => error!(error = %e, "controller failed; shutting down"),
        }

        self.cancel.cancel();
        self.state.send_replace(ControllerState::Closed);
        drop(self);
        publisher_done.wait().await;
        done.fire();
    }

    async fn process(&mut self) -> Result<(), CoreError> {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(()),

                result = self.lister.recv() => {
                    let Some(result) = result else { return Ok(()) };
                    self.apply_list(result?).await?;
                }

                event = self.watcher.next_event() => {
                    let Some(event) = event else { return Ok(()) };
                    let events = self.cache.update(event).await?;
                    self.distribute(events).await?;
                }
            }
        }
    }

    async fn apply_list(&mut self, list: ObjectList) -> Result<(), CoreError> {
        let ObjectList {
            resource_version,
            items,
        } = list;
        let count = items.len();

        let events = self
            .cache
            .sync(items.into_iter().map(Arc::new).collect())
            .await?;
        debug!(
            version = %resource_version,
            items = count,
            events = events.len(),
            "list applied"
        );

        if !self.ready.is_fired() {
            self.ready.fire();
            self.state.send_replace(ControllerState::Ready);
            info!(version = %resource_version, items = count, "controller ready");
        }

        self.distribute(events).await?;
        self.watcher.reset(&resource_version).await
    }

    /// Hand events to the publisher, waiting for room. Never lossy.
    async fn distribute(&self, events: Vec<Event>) -> Result<(), CoreError> {
        for event in events {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(CoreError::NotRunning),
                sent = self.feed.send(event) => {
                    if !sent {
                        return Err(CoreError::NotRunning);
                    }
                }
            }
        }
        Ok(())
    }
}
