// Shared helpers for unit tests.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client::{Client, ClientError, ListOptions, WatchEvent, WatchStream, watch_channel};
use crate::event::{Event, EventType};
use crate::object::{Object, ObjectList};
use crate::signal::Signal;

pub(crate) const WAIT: Duration = Duration::from_secs(10);
const SETTLE: Duration = Duration::from_millis(50);

pub(crate) fn gen_object(namespace: &str, name: &str, version: &str) -> Object {
    Object::new(namespace, name, version)
}

pub(crate) fn gen_event(kind: EventType, namespace: &str, name: &str, version: &str) -> Event {
    Event::new(kind, Arc::new(gen_object(namespace, name, version)))
}

pub(crate) async fn assert_fired(signal: &Signal, what: &str) {
    assert!(
        tokio::time::timeout(WAIT, signal.wait()).await.is_ok(),
        "{what} signal did not fire"
    );
}

pub(crate) async fn assert_not_fired(signal: &Signal, what: &str) {
    assert!(
        tokio::time::timeout(SETTLE, signal.wait()).await.is_err(),
        "{what} signal fired unexpectedly"
    );
}

pub(crate) async fn assert_ready(ready: &Signal) {
    assert_fired(ready, "ready").await;
}

pub(crate) async fn assert_not_ready(ready: &Signal) {
    assert_not_fired(ready, "ready").await;
}

pub(crate) async fn assert_done(done: &Signal) {
    assert_fired(done, "done").await;
}

pub(crate) async fn assert_not_done(done: &Signal) {
    assert_not_fired(done, "done").await;
}

// ── Scripted upstream ────────────────────────────────────────────────

/// An opened watch: the requested version and the feed for its stream.
pub(crate) struct OpenedWatch {
    pub version: String,
    pub feed: mpsc::Sender<Result<WatchEvent, ClientError>>,
}

/// Upstream double. `list` answers with the current scripted result;
/// every `watch` call hands its feed to the test.
pub(crate) struct TestClient {
    list: Mutex<Result<ObjectList, ClientError>>,
    list_calls: AtomicUsize,
    watches: mpsc::UnboundedSender<OpenedWatch>,
}

impl TestClient {
    pub(crate) fn new(list: ObjectList) -> (Arc<Self>, mpsc::UnboundedReceiver<OpenedWatch>) {
        let (watches, opened) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            list: Mutex::new(Ok(list)),
            list_calls: AtomicUsize::new(0),
            watches,
        });
        (client, opened)
    }

    pub(crate) fn set_list(&self, result: Result<ObjectList, ClientError>) {
        *self.list.lock().unwrap() = result;
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Client for TestClient {
    async fn list(&self, _options: &ListOptions) -> Result<ObjectList, ClientError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.list.lock().unwrap().clone()
    }

    async fn watch(&self, options: &ListOptions) -> Result<WatchStream, ClientError> {
        let (feed, stream) = watch_channel(16);
        let _ = self.watches.send(OpenedWatch {
            version: options.resource_version.clone(),
            feed,
        });
        Ok(stream)
    }
}

pub(crate) async fn next_watch(opened: &mut mpsc::UnboundedReceiver<OpenedWatch>) -> OpenedWatch {
    tokio::time::timeout(WAIT, opened.recv())
        .await
        .ok()
        .flatten()
        .expect("watch was not opened")
}

pub(crate) fn list_of(version: &str, items: &[(&str, &str, &str)]) -> ObjectList {
    ObjectList::new(
        version,
        items
            .iter()
            .map(|(ns, name, v)| gen_object(ns, name, v))
            .collect(),
    )
}
