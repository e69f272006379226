// ── Periodic lister ──
//
// Lists the upstream collection once on start, then again every
// `refresh_period` or on request. At most one listing is in flight or
// awaiting delivery at any time: the next list only starts once the
// consumer has taken the previous result.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{Client, ClientError, ListOptions};
use crate::object::ObjectList;

pub(crate) type ListResult = Result<ObjectList, ClientError>;

/// Handle to a running lister task.
pub(crate) struct Lister {
    results: mpsc::Receiver<ListResult>,
    refresh: mpsc::Sender<()>,
}

impl Lister {
    pub(crate) fn spawn(client: Arc<dyn Client>, period: Duration, parent: &CancellationToken) -> Self {
        let (result_tx, results) = mpsc::channel(1);
        let (refresh, refresh_rx) = mpsc::channel(1);

        tokio::spawn(lister_task(
            client,
            period,
            result_tx,
            refresh_rx,
            parent.child_token(),
        ));

        Self { results, refresh }
    }

    /// Next listing result; `None` once the lister has stopped.
    pub(crate) async fn recv(&mut self) -> Option<ListResult> {
        self.results.recv().await
    }

    /// Sender that asks for an immediate relist. Requests coalesce.
    pub(crate) fn refresh_handle(&self) -> mpsc::Sender<()> {
        self.refresh.clone()
    }
}

async fn lister_task(
    client: Arc<dyn Client>,
    period: Duration,
    results: mpsc::Sender<ListResult>,
    mut refresh: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let options = ListOptions::default();

    loop {
        // Wait for the previous result to be taken before listing again.
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            permit = results.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = client.list(&options) => result,
        };

        match &result {
            Ok(list) => debug!(
                count = list.items.len(),
                version = %list.resource_version,
                "list complete"
            ),
            Err(e) => warn!(error = %e, "list failed"),
        }
        permit.send(result);

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(period) => {}
            Some(()) = refresh.recv() => debug!("relist requested"),
        }
    }

    debug!("lister stopped");
}
