// ── Watcher ──
//
// Supervises a sequence of watch sessions. `reset(version)` replaces the
// current session with one rooted at `version` and hands back a fresh
// event channel. A session that ends on its own is reopened at the last
// version seen, after the reconnect delay.
//
// Event forwarding is lossy: a full output buffer drops the event. The
// cache's version gate makes duplicates harmless, and a missed event is
// recovered by the next relist.

mod session;

use std::future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use self::session::WatchSession;
use crate::client::Client;
use crate::config::{ReconnectConfig, calculate_backoff};
use crate::error::CoreError;
use crate::event::Event;

struct Reset {
    version: String,
    reply: oneshot::Sender<mpsc::Receiver<Event>>,
}

/// Handle to a running watcher task.
pub(crate) struct Watcher {
    resets: mpsc::Sender<Reset>,
    events: Option<mpsc::Receiver<Event>>,
}

impl Watcher {
    pub(crate) fn spawn(
        client: Arc<dyn Client>,
        reconnect: ReconnectConfig,
        buffer: usize,
        parent: &CancellationToken,
    ) -> Self {
        let (resets, reset_rx) = mpsc::channel(1);

        let task = WatcherTask {
            client,
            reconnect,
            buffer: buffer.max(1),
            cancel: parent.child_token(),
            session: None,
            out: None,
            version: String::new(),
            retry: None,
            attempt: 0,
        };
        tokio::spawn(task.run(reset_rx));

        Self {
            resets,
            events: None,
        }
    }

    /// Restart watching from `version`. Events from earlier sessions
    /// that were not yet consumed are discarded.
    pub(crate) async fn reset(&mut self, version: &str) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.resets
            .send(Reset {
                version: version.to_owned(),
                reply,
            })
            .await
            .map_err(|_| CoreError::NotRunning)?;
        self.events = Some(rx.await.map_err(|_| CoreError::NotRunning)?);
        Ok(())
    }

    /// Next watch event. Pending until the first reset; `None` once the
    /// watcher has stopped.
    pub(crate) async fn next_event(&mut self) -> Option<Event> {
        let Some(events) = self.events.as_mut() else {
            return future::pending().await;
        };
        let event = events.recv().await;
        if event.is_none() {
            self.events = None;
        }
        event
    }
}

struct WatcherTask {
    client: Arc<dyn Client>,
    reconnect: ReconnectConfig,
    buffer: usize,
    cancel: CancellationToken,

    session: Option<WatchSession>,
    out: Option<mpsc::Sender<Event>>,
    version: String,
    retry: Option<Pin<Box<Sleep>>>,
    attempt: u32,
}

impl WatcherTask {
    async fn run(mut self, mut resets: mpsc::Receiver<Reset>) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                reset = resets.recv() => {
                    let Some(reset) = reset else { break };
                    self.reset(reset);
                }
                event = next_session_event(&mut self.session) => match event {
                    Some(event) => self.forward(event),
                    None => self.session_ended(),
                },
                () = retry_elapsed(&mut self.retry) => {
                    self.retry = None;
                    debug!(version = %self.version, attempt = self.attempt, "reopening watch");
                    self.open();
                }
            }
        }

        self.session = None;
        debug!("watcher stopped");
    }

    fn reset(&mut self, reset: Reset) {
        let (tx, rx) = mpsc::channel(self.buffer);
        if reset.reply.send(rx).is_err() {
            return;
        }
        debug!(version = %reset.version, "watch reset");

        self.out = Some(tx);
        self.version = reset.version;
        self.retry = None;
        self.attempt = 0;
        self.open();
    }

    fn open(&mut self) {
        // Stop the old session before its replacement connects.
        self.session = None;
        self.session = Some(WatchSession::start(
            Arc::clone(&self.client),
            &self.version,
            self.buffer,
            &self.cancel,
        ));
    }

    fn forward(&mut self, event: Event) {
        self.attempt = 0;
        event
            .object
            .resource_version()
            .clone_into(&mut self.version);

        let Some(out) = self.out.as_ref() else { return };
        match out.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(event = %event, "watch buffer full; event dropped");
            }
            Err(TrySendError::Closed(_)) => self.out = None,
        }
    }

    fn session_ended(&mut self) {
        self.session = None;

        if let Some(max) = self.reconnect.max_retries {
            if self.attempt >= max {
                warn!(
                    version = %self.version,
                    attempts = self.attempt,
                    "watch retries exhausted; waiting for reset"
                );
                return;
            }
        }

        let delay = calculate_backoff(self.attempt, &self.reconnect);
        self.attempt = self.attempt.saturating_add(1);
        debug!(
            version = %self.version,
            attempt = self.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "watch session ended; retry scheduled"
        );
        self.retry = Some(Box::pin(tokio::time::sleep(delay)));
    }
}

async fn next_session_event(session: &mut Option<WatchSession>) -> Option<Event> {
    match session.as_mut() {
        Some(session) => session.next().await,
        None => future::pending().await,
    }
}

async fn retry_elapsed(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::WatchEvent;
    use crate::event::EventType;
    use crate::object::Object;
    use crate::testutil::{TestClient, list_of, next_watch};

    fn spawn(client: Arc<TestClient>, reconnect: ReconnectConfig) -> (Watcher, CancellationToken) {
        let token = CancellationToken::new();
        let watcher = Watcher::spawn(client, reconnect, 8, &token);
        (watcher, token)
    }

    #[tokio::test(start_paused = true)]
    async fn reset_opens_session_at_version() {
        let (client, mut watches) = TestClient::new(list_of("1", &[]));
        let (mut watcher, _token) = spawn(client, ReconnectConfig::default());

        watcher.reset("5").await.unwrap();
        let watch = next_watch(&mut watches).await;
        assert_eq!(watch.version, "5");

        watch
            .feed
            .send(Ok(WatchEvent::Added(Object::new("a", "x", "6"))))
            .await
            .unwrap();
        let event = watcher.next_event().await.unwrap();
        assert_eq!(event.kind, EventType::Create);
        assert_eq!(event.object.resource_version(), "6");
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_at_last_seen_version() {
        let (client, mut watches) = TestClient::new(list_of("1", &[]));
        let (mut watcher, _token) = spawn(client, ReconnectConfig::default());

        watcher.reset("5").await.unwrap();
        let watch = next_watch(&mut watches).await;
        watch
            .feed
            .send(Ok(WatchEvent::Modified(Object::new("a", "x", "9"))))
            .await
            .unwrap();
        watcher.next_event().await.unwrap();

        let closed_at = tokio::time::Instant::now();
        drop(watch);

        let watch = next_watch(&mut watches).await;
        assert_eq!(watch.version, "9");
        assert!(closed_at.elapsed() >= Duration::from_secs(1));

        // Same output channel survives the reconnect.
        watch
            .feed
            .send(Ok(WatchEvent::Deleted(Object::new("a", "x", "10"))))
            .await
            .unwrap();
        assert_eq!(watcher.next_event().await.unwrap().kind, EventType::Delete);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_replaces_session() {
        let (client, mut watches) = TestClient::new(list_of("1", &[]));
        let (mut watcher, _token) = spawn(client, ReconnectConfig::default());

        watcher.reset("1").await.unwrap();
        let first = next_watch(&mut watches).await;

        watcher.reset("2").await.unwrap();
        let second = next_watch(&mut watches).await;
        assert_eq!(second.version, "2");

        tokio::time::timeout(Duration::from_secs(1), first.feed.closed())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_retrying_after_max_retries() {
        let (client, mut watches) = TestClient::new(list_of("1", &[]));
        let reconnect = ReconnectConfig {
            max_retries: Some(1),
            ..ReconnectConfig::default()
        };
        let (mut watcher, _token) = spawn(client, reconnect);

        watcher.reset("1").await.unwrap();
        drop(next_watch(&mut watches).await);
        drop(next_watch(&mut watches).await);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(watches.try_recv().is_err());

        watcher.reset("3").await.unwrap();
        assert_eq!(next_watch(&mut watches).await.version, "3");
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_drops_without_stalling_the_feed() {
        let (client, mut watches) = TestClient::new(list_of("1", &[]));
        let token = CancellationToken::new();
        let mut watcher = Watcher::spawn(client, ReconnectConfig::default(), 2, &token);

        watcher.reset("1").await.unwrap();
        let watch = next_watch(&mut watches).await;

        // Far more than the feed and both buffers hold together.
        tokio::time::timeout(Duration::from_secs(5), async {
            for v in 2..42 {
                let obj = Object::new("a", "x", v.to_string());
                watch.feed.send(Ok(WatchEvent::Modified(obj))).await.unwrap();
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut kept = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), watcher.next_event()).await
        {
            kept.push(event.object.version().unwrap());
        }
        assert!(!kept.is_empty());
        assert!(kept.len() < 40, "nothing was dropped: {kept:?}");
        assert!(kept.windows(2).all(|w| w[0] < w[1]), "out of order: {kept:?}");

        watch
            .feed
            .send(Ok(WatchEvent::Modified(Object::new("a", "x", "99"))))
            .await
            .unwrap();
        let event = watcher.next_event().await.unwrap();
        assert_eq!(event.object.resource_version(), "99");
    }

    #[tokio::test(start_paused = true)]
    async fn next_event_pends_before_reset_and_ends_after_stop() {
        let (client, _watches) = TestClient::new(list_of("1", &[]));
        let (mut watcher, token) = spawn(client, ReconnectConfig::default());

        assert!(
            tokio::time::timeout(Duration::from_secs(5), watcher.next_event())
                .await
                .is_err()
        );

        watcher.reset("1").await.unwrap();
        token.cancel();
        assert!(watcher.next_event().await.is_none());
        assert!(watcher.reset("2").await.is_err());
    }
}
