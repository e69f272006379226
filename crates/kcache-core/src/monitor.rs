// ── Monitor ──
//
// Turns a subscription into callbacks: one `on_initialize` with the
// snapshot at readiness, then one call per event, in order, until the
// subscription or the monitor closes. Built purely on `Subscription`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::event::EventType;
use crate::object::Object;
use crate::publisher::Publisher;
use crate::signal::Signal;
use crate::subscription::Subscription;

/// Callbacks driven by a [`Monitor`]. Every method defaults to a no-op.
pub trait Handler: Send + 'static {
    fn on_initialize(&mut self, _objects: Vec<Arc<Object>>) {}
    fn on_create(&mut self, _object: Arc<Object>) {}
    fn on_update(&mut self, _object: Arc<Object>) {}
    fn on_delete(&mut self, _object: Arc<Object>) {}
}

type ListFn = Box<dyn FnMut(Vec<Arc<Object>>) + Send>;
type ObjectFn = Box<dyn FnMut(Arc<Object>) + Send>;

/// Assembles a [`Handler`] from optional closures.
#[derive(Default)]
pub struct HandlerBuilder {
    on_initialize: Option<ListFn>,
    on_create: Option<ObjectFn>,
    on_update: Option<ObjectFn>,
    on_delete: Option<ObjectFn>,
}

impl HandlerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_initialize(mut self, f: impl FnMut(Vec<Arc<Object>>) + Send + 'static) -> Self {
        self.on_initialize = Some(Box::new(f));
        self
    }

    pub fn on_create(mut self, f: impl FnMut(Arc<Object>) + Send + 'static) -> Self {
        self.on_create = Some(Box::new(f));
        self
    }

    pub fn on_update(mut self, f: impl FnMut(Arc<Object>) + Send + 'static) -> Self {
        self.on_update = Some(Box::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl FnMut(Arc<Object>) + Send + 'static) -> Self {
        self.on_delete = Some(Box::new(f));
        self
    }

    pub fn build(self) -> FnHandler {
        FnHandler(self)
    }
}

/// Closure-backed [`Handler`] built by [`HandlerBuilder`].
pub struct FnHandler(HandlerBuilder);

impl Handler for FnHandler {
    fn on_initialize(&mut self, objects: Vec<Arc<Object>>) {
        if let Some(f) = self.0.on_initialize.as_mut() {
            f(objects);
        }
    }

    fn on_create(&mut self, object: Arc<Object>) {
        if let Some(f) = self.0.on_create.as_mut() {
            f(object);
        }
    }

    fn on_update(&mut self, object: Arc<Object>) {
        if let Some(f) = self.0.on_update.as_mut() {
            f(object);
        }
    }

    fn on_delete(&mut self, object: Arc<Object>) {
        if let Some(f) = self.0.on_delete.as_mut() {
            f(object);
        }
    }
}

/// Running callback consumer. Dropping the handle does not stop it;
/// call [`Monitor::close`].
pub struct Monitor {
    cancel: CancellationToken,
    done: Signal,
}

impl Monitor {
    /// Subscribe to `publisher` and start driving `handler`.
    pub async fn new<P>(publisher: &P, handler: impl Handler) -> Result<Self, CoreError>
    where
        P: Publisher + ?Sized,
    {
        let sub = publisher.subscribe().await?;
        let cancel = CancellationToken::new();
        let done = Signal::new();

        tokio::spawn(monitor_task(sub, handler, cancel.clone(), done.clone()));

        Ok(Self { cancel, done })
    }

    /// Stop delivering callbacks and release the subscription.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn done(&self) -> Signal {
        self.done.clone()
    }
}

async fn monitor_task<H: Handler>(
    mut sub: Subscription,
    mut handler: H,
    cancel: CancellationToken,
    done: Signal,
) {
    let ready = sub.ready();
    let sub_done = sub.done();

    let initialized = tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = sub_done.wait() => false,
        () = ready.wait() => true,
    };

    if initialized {
        match sub.cache().list().await {
            Ok(objects) => {
                handler.on_initialize(objects);
                dispatch(&mut sub, &mut handler, &cancel).await;
            }
            Err(e) => warn!(error = %e, "monitor could not read initial state"),
        }
    }

    sub.close();
    debug!(subscription = %sub.id(), "monitor stopped");
    drop(sub);
    done.fire();
}

async fn dispatch<H: Handler>(sub: &mut Subscription, handler: &mut H, cancel: &CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            event = sub.recv() => event,
        };
        let Some(event) = event else { return };

        match event.kind {
            EventType::Create => handler.on_create(event.object),
            EventType::Update => handler.on_update(event.object),
            EventType::Delete => handler.on_delete(event.object),
        }
    }
}
