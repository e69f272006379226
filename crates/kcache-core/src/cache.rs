// ── Versioned cache actor ──
//
// A keyed store of current objects owned by a single task. Every read
// and write goes through the task's request channel, so the map is never
// touched from two places at once and no lock is involved.
//
// Reconciliation rules live on `CacheState` as plain methods; the actor
// loop only routes requests to them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::CoreError;
use crate::event::{Event, EventType};
use crate::filter::Filter;
use crate::nsname::NsName;
use crate::object::Object;
use crate::signal::Signal;

const REQUEST_CHANNEL_SIZE: usize = 64;

/// Read access to a cache.
#[async_trait]
pub trait CacheReader: Send + Sync {
    /// Current object for `namespace/name`, if present.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Object>>, CoreError>;

    /// Snapshot of every stored object, in no particular order.
    async fn list(&self) -> Result<Vec<Arc<Object>>, CoreError>;

    /// Current object with the same identity as `obj`.
    async fn get_object(&self, obj: &Object) -> Result<Option<Arc<Object>>, CoreError> {
        self.get(obj.namespace(), obj.name()).await
    }
}

// ── Reconciliation ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CacheEntry {
    version: u64,
    object: Arc<Object>,
}

/// Cache contents plus the filter they are bound to.
///
/// `items` is `None` until the first sync, which adopts its list silently.
#[derive(Debug, Default)]
pub(crate) struct CacheState {
    items: Option<HashMap<NsName, CacheEntry>>,
    filter: Filter,
}

impl CacheState {
    pub(crate) fn new(filter: Filter) -> Self {
        Self {
            items: None,
            filter,
        }
    }

    /// Reconcile a full snapshot.
    pub(crate) fn sync(&mut self, list: Vec<Arc<Object>>) -> Vec<Event> {
        let incoming = self.admit(list);
        match self.items.take() {
            None => {
                debug!(count = incoming.len(), "cache initialized");
                self.items = Some(incoming.into_iter().collect());
                Vec::new()
            }
            Some(current) => {
                let (items, events) = reconcile(current, incoming);
                self.items = Some(items);
                events
            }
        }
    }

    /// Apply one discrete event.
    pub(crate) fn update(&mut self, event: Event) -> Vec<Event> {
        let Event { kind, object } = event;
        if let Err(e) = object.check_identity() {
            warn!(error = %e, "skipping event");
            return Vec::new();
        }
        let key = object.key();
        let items = self.items.get_or_insert_with(HashMap::new);

        if kind == EventType::Delete {
            return match items.remove(&key) {
                Some(_) => vec![Event::delete(object)],
                None => Vec::new(),
            };
        }

        let version = match object.version() {
            Ok(v) => v,
            Err(e) => {
                warn!(namespace = %key.namespace, name = %key.name, error = %e, "skipping event");
                return Vec::new();
            }
        };
        let accepted = self.filter.accept(&object);

        match items.get(&key).map(|entry| entry.version) {
            None if !accepted => Vec::new(),
            None => {
                items.insert(key, CacheEntry { version, object: Arc::clone(&object) });
                vec![Event::create(object)]
            }
            Some(current) if version <= current => {
                trace!(
                    namespace = %key.namespace,
                    name = %key.name,
                    version,
                    current,
                    "stale write skipped"
                );
                Vec::new()
            }
            Some(_) if !accepted => {
                items.remove(&key);
                vec![Event::delete(object)]
            }
            Some(_) => {
                items.insert(key, CacheEntry { version, object: Arc::clone(&object) });
                vec![Event::update(object)]
            }
        }
    }

    /// Swap the filter and re-evaluate membership.
    ///
    /// With a list this is a sync of the newly accepted subset. Without
    /// one, members the new filter rejects are removed.
    pub(crate) fn refilter(&mut self, list: Option<Vec<Arc<Object>>>, filter: Filter) -> Vec<Event> {
        if self.filter == filter {
            return Vec::new();
        }
        self.filter = filter;

        match (self.items.take(), list) {
            (None, None) => Vec::new(),
            (None, Some(list)) => {
                self.items = Some(self.admit(list).into_iter().collect());
                Vec::new()
            }
            (Some(mut items), None) => {
                let mut events = Vec::new();
                items.retain(|_, entry| {
                    let keep = self.filter.accept(&entry.object);
                    if !keep {
                        events.push(Event::delete(Arc::clone(&entry.object)));
                    }
                    keep
                });
                self.items = Some(items);
                events
            }
            (Some(current), Some(list)) => {
                let incoming = self.admit(list);
                let (items, events) = reconcile(current, incoming);
                self.items = Some(items);
                events
            }
        }
    }

    pub(crate) fn get(&self, key: &NsName) -> Option<Arc<Object>> {
        self.items
            .as_ref()
            .and_then(|items| items.get(key))
            .map(|entry| Arc::clone(&entry.object))
    }

    pub(crate) fn list(&self) -> Vec<Arc<Object>> {
        self.items
            .iter()
            .flat_map(HashMap::values)
            .map(|entry| Arc::clone(&entry.object))
            .collect()
    }

    /// Keyed entries for the objects this cache accepts.
    ///
    /// Objects without identity or with an unparseable version are
    /// logged and dropped without affecting the rest of the batch.
    fn admit(&self, list: Vec<Arc<Object>>) -> Vec<(NsName, CacheEntry)> {
        list.into_iter()
            .filter(|obj| self.filter.accept(obj))
            .filter_map(|object| {
                if let Err(e) = object.check_identity() {
                    warn!(error = %e, "skipping listed object");
                    return None;
                }
                match object.version() {
                    Ok(version) => Some((object.key(), CacheEntry { version, object })),
                    Err(e) => {
                        warn!(
                            namespace = object.namespace(),
                            name = object.name(),
                            error = %e,
                            "skipping listed object"
                        );
                        None
                    }
                }
            })
            .collect()
    }
}

/// Diff `incoming` against `current`, returning the new contents and
/// the create/update/delete events between them.
fn reconcile(
    mut current: HashMap<NsName, CacheEntry>,
    incoming: Vec<(NsName, CacheEntry)>,
) -> (HashMap<NsName, CacheEntry>, Vec<Event>) {
    let mut next = HashMap::with_capacity(incoming.len());
    let mut events = Vec::new();

    for (key, entry) in incoming {
        let previous = next.remove(&key).or_else(|| current.remove(&key));
        match previous {
            None => {
                events.push(Event::create(Arc::clone(&entry.object)));
                next.insert(key, entry);
            }
            Some(prev) if entry.version > prev.version => {
                events.push(Event::update(Arc::clone(&entry.object)));
                next.insert(key, entry);
            }
            Some(prev) => {
                trace!(
                    namespace = %key.namespace,
                    name = %key.name,
                    version = entry.version,
                    current = prev.version,
                    "stale listing skipped"
                );
                next.insert(key, prev);
            }
        }
    }

    events.extend(current.into_values().map(|entry| Event::delete(entry.object)));
    (next, events)
}

// ── Actor ────────────────────────────────────────────────────────────

enum Request {
    Sync {
        list: Vec<Arc<Object>>,
        reply: oneshot::Sender<Vec<Event>>,
    },
    Update {
        event: Event,
        reply: oneshot::Sender<Vec<Event>>,
    },
    Refilter {
        list: Option<Vec<Arc<Object>>>,
        filter: Filter,
        reply: oneshot::Sender<Vec<Event>>,
    },
    Get {
        key: NsName,
        reply: oneshot::Sender<Option<Arc<Object>>>,
    },
    List {
        reply: oneshot::Sender<Vec<Arc<Object>>>,
    },
}

/// Handle to a running cache actor.
///
/// Clones share the same actor. The actor stops when its parent token is
/// cancelled, when [`Cache::stop`] is called, or when every handle is gone.
#[derive(Clone)]
pub struct Cache {
    tx: mpsc::Sender<Request>,
    stop: CancellationToken,
    done: Signal,
}

impl Cache {
    /// Spawn a cache bound to `filter`.
    pub(crate) fn spawn(parent: &CancellationToken, filter: Filter) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let stop = parent.child_token();
        let done = Signal::new();

        tokio::spawn(cache_task(
            CacheState::new(filter),
            rx,
            stop.clone(),
            done.clone(),
        ));

        Self { tx, stop, done }
    }

    pub(crate) async fn sync(&self, list: Vec<Arc<Object>>) -> Result<Vec<Event>, CoreError> {
        self.request(|reply| Request::Sync { list, reply }).await
    }

    pub(crate) async fn update(&self, event: Event) -> Result<Vec<Event>, CoreError> {
        self.request(|reply| Request::Update { event, reply }).await
    }

    pub(crate) async fn refilter(
        &self,
        list: Option<Vec<Arc<Object>>>,
        filter: Filter,
    ) -> Result<Vec<Event>, CoreError> {
        self.request(|reply| Request::Refilter { list, filter, reply })
            .await
    }

    pub(crate) fn stop(&self) {
        self.stop.cancel();
    }

    /// Fires once the actor has exited.
    pub fn done(&self) -> Signal {
        self.done.clone()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, CoreError> {
        if self.stop.is_cancelled() {
            return Err(CoreError::NotRunning);
        }

        let (reply, rx) = oneshot::channel();
        tokio::select! {
            biased;
            () = self.stop.cancelled() => return Err(CoreError::NotRunning),
            sent = self.tx.send(build(reply)) => sent.map_err(|_| CoreError::NotRunning)?,
        }

        tokio::select! {
            biased;
            () = self.stop.cancelled() => Err(CoreError::NotRunning),
            result = rx => result.map_err(|_| CoreError::NotRunning),
        }
    }
}

#[async_trait]
impl CacheReader for Cache {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Object>>, CoreError> {
        let key = NsName::new(namespace, name);
        self.request(|reply| Request::Get { key, reply }).await
    }

    async fn list(&self) -> Result<Vec<Arc<Object>>, CoreError> {
        self.request(|reply| Request::List { reply }).await
    }
}

async fn cache_task(
    mut state: CacheState,
    mut rx: mpsc::Receiver<Request>,
    stop: CancellationToken,
    done: Signal,
) {
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            request = rx.recv() => {
                let Some(request) = request else { break };
                handle(&mut state, request);
            }
        }
    }

    stop.cancel();
    done.fire();
    debug!("cache stopped");
}

fn handle(state: &mut CacheState, request: Request) {
    // A dropped reply receiver means the caller gave up; nothing to do.
    match request {
        Request::Sync { list, reply } => {
            let _ = reply.send(state.sync(list));
        }
        Request::Update { event, reply } => {
            let _ = reply.send(state.update(event));
        }
        Request::Refilter { list, filter, reply } => {
            let _ = reply.send(state.refilter(list, filter));
        }
        Request::Get { key, reply } => {
            let _ = reply.send(state.get(&key));
        }
        Request::List { reply } => {
            let _ = reply.send(state.list());
        }
    }
}
