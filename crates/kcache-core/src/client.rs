// ── Upstream client contract ──
//
// The transport lives outside this crate. Anything that can produce a
// versioned listing and a stream of add/modify/delete notifications
// plugs in through `Client`.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::object::{Object, ObjectList};

/// Errors reported by an upstream client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("upstream status {code}: {message}")]
    Status { code: u16, message: String },
}

/// Options passed to `list` and `watch`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    /// Version to start from. Empty means "current".
    #[serde(default)]
    pub resource_version: String,

    #[serde(default)]
    pub watch: bool,
}

impl ListOptions {
    /// Options for a watch that starts just after `resource_version`.
    pub fn watch_from(resource_version: impl Into<String>) -> Self {
        Self {
            resource_version: resource_version.into(),
            watch: true,
        }
    }
}

/// Out-of-band notice carried on a watch stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
}

/// One notification from an upstream watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent {
    Added(Object),
    Modified(Object),
    Deleted(Object),
    #[serde(rename = "ERROR")]
    Status(Status),
}

/// Live notification stream. Dropping it releases the connection.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, ClientError>>;

/// Data source for one resource kind and scope.
#[async_trait]
pub trait Client: Send + Sync {
    /// Snapshot of every matching object plus the collection version.
    async fn list(&self, options: &ListOptions) -> Result<ObjectList, ClientError>;

    /// Notifications starting just after `options.resource_version`.
    ///
    /// The stream may end at any time; the watcher reopens it.
    async fn watch(&self, options: &ListOptions) -> Result<WatchStream, ClientError>;
}

/// Channel-backed [`WatchStream`].
///
/// Whatever is sent on the returned sender comes out of the stream;
/// dropping the sender ends it.
pub fn watch_channel(
    capacity: usize,
) -> (mpsc::Sender<Result<WatchEvent, ClientError>>, WatchStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, ReceiverStream::new(rx).boxed())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn watch_event_wire_form() {
        let raw = json!({
            "type": "MODIFIED",
            "object": { "metadata": { "namespace": "a", "name": "b", "resourceVersion": "4" } }
        });
        let evt: WatchEvent = serde_json::from_value(raw).unwrap();
        match evt {
            WatchEvent::Modified(obj) => assert_eq!(obj.resource_version(), "4"),
            other => panic!("unexpected event: {other:?}"),
        }

        let raw = json!({ "type": "ERROR", "object": { "code": 410, "message": "gone" } });
        let evt: WatchEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(
            evt,
            WatchEvent::Status(Status {
                code: 410,
                message: "gone".into(),
                reason: String::new(),
            })
        );
    }

    #[tokio::test]
    async fn channel_stream_ends_when_sender_drops() {
        let (tx, mut stream) = watch_channel(4);
        tx.send(Ok(WatchEvent::Added(Object::new("a", "b", "1"))))
            .await
            .unwrap();
        drop(tx);

        assert!(matches!(stream.next().await, Some(Ok(WatchEvent::Added(_)))));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn watch_from_sets_flag() {
        let opts = ListOptions::watch_from("12");
        assert_eq!(opts.resource_version, "12");
        assert!(opts.watch);
        assert!(!ListOptions::default().watch);
    }
}
