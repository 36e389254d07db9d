//! Error kinds for the shell-interaction core.
//!
//! These map directly to the kinds a caller needs to branch on: misuse of the
//! session API, a broken remote transport, a timeout, a dead PTY, a bad
//! expect script, or a storage failure. Transport/timeout classification is
//! done by substring match against the underlying error's `Display` output,
//! since the two transports (local `io::Error`, remote `russh::Error`) don't
//! share a richer error type to match on.

use thiserror::Error;

/// Substrings that indicate a remote connection has broken and should be
/// retried via reconnection rather than surfaced as a hard failure.
const BROKEN_TRANSPORT_MARKERS: &[&str] = &[
    "EOF",
    "broken pipe",
    "connection reset",
    "use of closed",
    "closed network connection",
    "channel closed",
];

/// Substrings that indicate a read/write hit a timeout rather than a real
/// I/O failure.
const TIMEOUT_MARKERS: &[&str] = &["timeout", "i/o timeout", "timed out"];

#[derive(Debug, Error)]
pub enum CoreError {
    /// Operation not valid in the session's current state (e.g. `Exec` on a
    /// closed session, `ProvideInput` when not awaiting input).
    #[error("{0}")]
    Misuse(String),

    /// The remote transport died mid-operation; the caller should retry
    /// after the core's own reconnection attempt also failed.
    #[error("connection lost: {0}")]
    TransportBroken(String),

    /// The overall operation deadline elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The PTY (or the process behind it) is confirmed dead.
    #[error("pty dead: {0}")]
    PtyDead(String),

    /// An expect script was malformed (e.g. an invalid regex) at
    /// registration time.
    #[error("invalid expect script: {0}")]
    ScriptError(String),

    /// The session store failed to read or write; callers should log and
    /// continue with an in-memory-only store.
    #[error("session store error: {0}")]
    StorageError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Classify a lower-level error message as indicating a broken remote
/// transport, per spec: recognized by substring match, case-sensitive for
/// `EOF` and lowercase for the rest (matching the literal markers).
pub fn is_transport_broken(message: &str) -> bool {
    BROKEN_TRANSPORT_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// Classify a lower-level error message as a timeout.
pub fn is_timeout(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TIMEOUT_MARKERS.iter().any(|marker| lower.contains(marker))
}
