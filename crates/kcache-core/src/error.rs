// ── Core error types ──
//
// Errors surfaced by kcache-core. Per-object problems (bad versions,
// missing identity) are logged and skipped inside the actors; they only
// appear here so the parsing helpers can report them. Actor-level
// failure is observed as channel closure, never threaded back through
// historical events.

use thiserror::Error;

use crate::client::ClientError;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Lifecycle ────────────────────────────────────────────────────
    /// The actor backing this handle has shut down.
    #[error("not running")]
    NotRunning,

    // ── Upstream ─────────────────────────────────────────────────────
    #[error("upstream error: {0}")]
    Client(#[from] ClientError),

    // ── Per-object errors ────────────────────────────────────────────
    #[error("invalid resource version: {version:?}")]
    InvalidVersion { version: String },

    #[error("invalid object: {reason}")]
    InvalidObject { reason: String },

    // ── Construction ─────────────────────────────────────────────────
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl CoreError {
    /// Whether this error means the target actor is gone.
    pub fn is_not_running(&self) -> bool {
        matches!(self, Self::NotRunning)
    }
}
