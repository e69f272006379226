// ── One-shot signals ──
//
// Readiness and completion are observed by any number of parties,
// including ones that show up after the fact. A `CancellationToken`
// already has exactly those semantics; `Signal` narrows it so only the
// owning actor can fire it.

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Idempotent, observe-many, fire-once signal.
#[derive(Debug, Clone, Default)]
pub struct Signal(CancellationToken);

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that fires when `token` is cancelled.
    pub(crate) fn from_token(token: CancellationToken) -> Self {
        Self(token)
    }

    /// Fire the signal. Firing twice is a no-op.
    pub(crate) fn fire(&self) {
        self.0.cancel();
    }

    pub fn is_fired(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once the signal has fired (immediately if it already has).
    pub fn wait(&self) -> WaitForCancellationFuture<'_> {
        self.0.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn late_observers_see_fired_signal() {
        let signal = Signal::new();
        let observer = signal.clone();
        assert!(!observer.is_fired());

        let waiter = tokio::spawn(async move { observer.wait().await });
        signal.fire();
        signal.fire();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .ok()
            .and_then(Result::ok)
            .expect("waiter should observe the signal");

        let late = signal.clone();
        assert!(late.is_fired());
        late.wait().await;
    }
}
