// ── Watch session ──
//
// One physical watch connection. Translates upstream notifications
// into events and ends on the first stream error, decode failure or
// close. The watcher decides whether to open another.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{Client, ListOptions, WatchEvent};
use crate::event::Event;

/// A running session. Dropping it closes the connection.
pub(crate) struct WatchSession {
    events: mpsc::Receiver<Event>,
    cancel: CancellationToken,
}

impl WatchSession {
    pub(crate) fn start(
        client: Arc<dyn Client>,
        version: &str,
        buffer: usize,
        parent: &CancellationToken,
    ) -> Self {
        let (tx, events) = mpsc::channel(buffer.max(1));
        let cancel = parent.child_token();

        tokio::spawn(session_task(
            client,
            ListOptions::watch_from(version),
            tx,
            cancel.clone(),
        ));

        Self { events, cancel }
    }

    /// Next event; `None` once the session has ended.
    pub(crate) async fn next(&mut self) -> Option<Event> {
        self.events.recv().await
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn session_task(
    client: Arc<dyn Client>,
    options: ListOptions,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    let version = options.resource_version.as_str();

    let opened = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        opened = client.watch(&options) => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, version, "failed to open watch");
            return;
        }
    };
    debug!(version, "watch session started");

    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            item = stream.next() => item,
        };

        let notification = match item {
            Some(Ok(notification)) => notification,
            Some(Err(e)) => {
                warn!(error = %e, version, "watch stream failed");
                break;
            }
            None => {
                debug!(version, "watch stream closed");
                break;
            }
        };

        let event = match notification {
            WatchEvent::Added(obj) => Event::create(Arc::new(obj)),
            WatchEvent::Modified(obj) => Event::update(Arc::new(obj)),
            WatchEvent::Deleted(obj) => Event::delete(Arc::new(obj)),
            WatchEvent::Status(status) => {
                info!(
                    code = status.code,
                    message = %status.message,
                    reason = %status.reason,
                    "watch status"
                );
                continue;
            }
        };

        if let Err(e) = event.object.check_identity() {
            warn!(error = %e, version, "undecodable watch object; ending session");
            break;
        }

        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(event = %event, "session buffer full; event dropped");
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}
