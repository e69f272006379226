//! End-to-end tests for the controller pipeline through the public API.
//!
//! A scripted upstream stands in for the real transport: lists return a
//! fixed snapshot and every opened watch hands its feed to the test.
#![allow(clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use kcache_core::{
    Client, ClientError, Controller, ControllerConfig, ControllerState, EventType, Filter,
    HandlerBuilder, LabelSelector, ListOptions, Monitor, Object, ObjectList, Publisher,
    WatchEvent, WatchStream, watch_channel,
};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

// ── Helpers ─────────────────────────────────────────────────────────

type Feed = mpsc::Sender<Result<WatchEvent, ClientError>>;

struct MockClient {
    list: Mutex<ObjectList>,
    watches: mpsc::UnboundedSender<(String, Feed)>,
}

impl MockClient {
    fn new(list: ObjectList) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Feed)>) {
        let (watches, opened) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            list: Mutex::new(list),
            watches,
        });
        (client, opened)
    }
}

#[async_trait]
impl Client for MockClient {
    async fn list(&self, _options: &ListOptions) -> Result<ObjectList, ClientError> {
        Ok(self.list.lock().unwrap().clone())
    }

    async fn watch(&self, options: &ListOptions) -> Result<WatchStream, ClientError> {
        let (feed, stream) = watch_channel(16);
        let _ = self.watches.send((options.resource_version.clone(), feed));
        Ok(stream)
    }
}

fn pod(name: &str, version: &str, app: &str) -> Object {
    Object::new("default", name, version).with_labels([("app", app)])
}

async fn start(
    items: Vec<Object>,
) -> (Controller, CancellationToken, mpsc::UnboundedReceiver<(String, Feed)>) {
    let (client, watches) = MockClient::new(ObjectList::new("10", items));
    let token = CancellationToken::new();
    let controller = Controller::builder()
        .client(client)
        .config(ControllerConfig {
            refresh_period: Duration::from_secs(3600),
            ..ControllerConfig::default()
        })
        .cancel_token(&token)
        .build()
        .unwrap();
    tokio::time::timeout(WAIT, controller.ready().wait())
        .await
        .unwrap();
    (controller, token, watches)
}

async fn next_feed(watches: &mut mpsc::UnboundedReceiver<(String, Feed)>) -> Feed {
    let (version, feed) = tokio::time::timeout(WAIT, watches.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(version, "10");
    feed
}

fn names(objects: &[Arc<Object>]) -> BTreeSet<String> {
    objects.iter().map(|o| o.name().to_owned()).collect()
}

// ── Controller ──────────────────────────────────────────────────────

#[tokio::test]
async fn ready_controller_serves_the_snapshot() {
    let (controller, _token, _watches) =
        start(vec![pod("web-1", "3", "web"), pod("db-1", "4", "db")]).await;

    assert_eq!(*controller.state().borrow(), ControllerState::Ready);
    let listed = assert_ok!(controller.cache().list().await);
    assert_eq!(
        names(&listed),
        BTreeSet::from(["db-1".to_owned(), "web-1".to_owned()])
    );
    let web = assert_ok!(controller.cache().get("default", "web-1").await).unwrap();
    assert_eq!(web.labels().get("app").map(String::as_str), Some("web"));
}

#[tokio::test]
async fn subscription_sees_watch_events_in_order() {
    let (controller, _token, mut watches) = start(vec![pod("web-1", "3", "web")]).await;
    let sub = assert_ok!(controller.subscribe().await);
    let feed = next_feed(&mut watches).await;

    feed.send(Ok(WatchEvent::Added(pod("web-2", "11", "web"))))
        .await
        .unwrap();
    feed.send(Ok(WatchEvent::Modified(pod("web-1", "12", "web"))))
        .await
        .unwrap();
    feed.send(Ok(WatchEvent::Deleted(pod("web-2", "13", "web"))))
        .await
        .unwrap();

    let got: Vec<String> = sub
        .into_stream()
        .take(3)
        .map(|e| e.to_string())
        .collect()
        .await;
    assert_eq!(
        got,
        vec![
            "create default/web-2@11",
            "update default/web-1@12",
            "delete default/web-2@13",
        ]
    );
}

#[tokio::test]
async fn filtered_subscription_tracks_only_matches() {
    let (controller, _token, mut watches) =
        start(vec![pod("web-1", "3", "web"), pod("db-1", "4", "db")]).await;
    let selector = LabelSelector::new().with_label("app", "web");
    let mut view = assert_ok!(
        controller
            .subscribe_with_filter(Filter::label_selector(selector))
            .await
    );
    tokio::time::timeout(WAIT, view.ready().wait()).await.unwrap();
    assert_eq!(
        names(&view.cache().list().await.unwrap()),
        BTreeSet::from(["web-1".to_owned()])
    );

    let feed = next_feed(&mut watches).await;
    feed.send(Ok(WatchEvent::Added(pod("db-2", "11", "db"))))
        .await
        .unwrap();
    feed.send(Ok(WatchEvent::Added(pod("web-2", "12", "web"))))
        .await
        .unwrap();

    let event = view.recv().await.unwrap();
    assert_eq!(event.kind, EventType::Create);
    assert_eq!(event.object.name(), "web-2");

    // Widen the filter: the view catches up from the parent's cache.
    assert_ok!(view.refilter(Filter::null()).await);
    let mut created = BTreeSet::new();
    for _ in 0..2 {
        let event = view.recv().await.unwrap();
        assert_eq!(event.kind, EventType::Create);
        created.insert(event.object.name().to_owned());
    }
    assert_eq!(
        created,
        BTreeSet::from(["db-1".to_owned(), "db-2".to_owned()])
    );
}

#[tokio::test]
async fn cloned_publisher_is_independent() {
    let (controller, _token, mut watches) = start(vec![pod("web-1", "3", "web")]).await;
    let clone = assert_ok!(controller.clone_controller().await);
    let mut clone_sub = assert_ok!(clone.subscribe().await);
    let mut root_sub = assert_ok!(controller.subscribe().await);
    tokio::time::timeout(WAIT, clone.ready().wait()).await.unwrap();

    let feed = next_feed(&mut watches).await;
    feed.send(Ok(WatchEvent::Modified(pod("web-1", "11", "web"))))
        .await
        .unwrap();
    assert_eq!(
        clone_sub.recv().await.unwrap().to_string(),
        "update default/web-1@11"
    );
    assert_eq!(
        root_sub.recv().await.unwrap().to_string(),
        "update default/web-1@11"
    );

    clone.close();
    tokio::time::timeout(WAIT, clone.done().wait()).await.unwrap();
    assert!(clone_sub.recv().await.is_none());
    assert!(!controller.done().is_fired());
}

#[tokio::test]
async fn monitor_gets_snapshot_then_events() {
    let (controller, _token, mut watches) = start(vec![pod("web-1", "3", "web")]).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let init_tx = tx.clone();
    let handler = HandlerBuilder::new()
        .on_initialize(move |objs| {
            let _ = init_tx.send(format!("init {}", objs.len()));
        })
        .on_delete(move |obj| {
            let _ = tx.send(format!("delete {}", obj.name()));
        })
        .build();
    let monitor = assert_ok!(Monitor::new(&controller, handler).await);
    assert_eq!(rx.recv().await.unwrap(), "init 1");

    let feed = next_feed(&mut watches).await;
    feed.send(Ok(WatchEvent::Deleted(pod("web-1", "11", "web"))))
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap(), "delete web-1");

    monitor.close();
    tokio::time::timeout(WAIT, monitor.done().wait())
        .await
        .unwrap();
}

#[tokio::test]
async fn cancelling_the_parent_token_shuts_down() {
    let (controller, token, _watches) = start(vec![]).await;
    let mut sub = assert_ok!(controller.subscribe().await);

    token.cancel();
    tokio::time::timeout(WAIT, controller.done().wait())
        .await
        .unwrap();
    assert_eq!(*controller.state().borrow(), ControllerState::Closed);
    assert!(sub.recv().await.is_none());
    assert!(assert_err!(controller.subscribe().await).is_not_running());
}
