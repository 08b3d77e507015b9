//! Core error taxonomy shared by the endpoint, cache, flow manager,
//! client and server modules.

use thiserror::Error;

/// Errors produced anywhere in the dispatch engine, flow acceptor or
/// connection cache.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A caller supplied an argument that fails basic validation
    /// (malformed endpoint string, empty method name, ...).
    #[error("bad argument: {0}")]
    BadArg(String),

    /// A peer violated the wire protocol: bad magic, unsupported
    /// version, truncated frame, checksum mismatch.
    #[error("bad protocol: {0}")]
    BadProtocol(String),

    /// An operation was attempted against a component in a state that
    /// does not allow it, e.g. `Write` on a `Closed` flow.
    #[error("bad state: {0}")]
    BadState(String),

    /// The referenced connection, flow or cache entry does not exist.
    #[error("does not exist: {0}")]
    NoExist(String),

    /// The invoker has no such method on the looked-up suffix.
    #[error("unknown method {method:?} on suffix {suffix:?}")]
    UnknownMethod {
        /// Method name requested.
        method: String,
        /// Object suffix the method was requested against.
        suffix: String,
    },

    /// The dispatcher has no handler registered for the suffix.
    #[error("unknown suffix: {0}")]
    UnknownSuffix(String),

    /// The remote end's blessings failed the configured trust policy.
    #[error("not trusted: {0}")]
    NotTrusted(String),

    /// The caller's blessings were valid but did not satisfy the
    /// invoker's authorizer.
    #[error("no access: {0}")]
    NoAccess(String),

    /// Name resolution returned zero usable servers after filtering.
    #[error("no servers available for {0}")]
    NoServers(String),

    /// A deadline elapsed before the operation completed.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// The operation was cancelled. Cancellation always takes priority
    /// over a simultaneous timeout.
    #[error("cancelled: {0}")]
    Canceled(String),

    /// An invariant was violated inside the runtime itself, not
    /// attributable to caller input or peer misbehavior.
    #[error("internal error: {0}")]
    Internal(String),

    /// Lower-level I/O failure, preserved for its source chain.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// True for errors that a retrying caller may reasonably retry
    /// against a different server without changing anything else.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::NoServers(_) | CoreError::Timeout(_) | CoreError::Io(_)
        )
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
