//! Error types for graph validation, configuration, guard evaluation, and execution.
//!
//! All errors implement `std::error::Error` via `thiserror` and are distinguishable by
//! [`GraphError::kind`], which callers use for `retry_on_errors`/`no_retry_errors` matching
//! and for CLI exit-code classification.

use std::fmt;

/// Canonical error-kind discriminant, independent of the `Display` message.
///
/// `retry_on_errors` / `no_retry_errors` in a node's retry config match on this
/// discriminant, never on the rendered message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    GraphCycle,
    EdgeDangling,
    ConfigInvalid,
    HandlerMissing,
    HandlerTimeout,
    HandlerFailed,
    GuardBlocked,
    GuardDelayed,
    RateLimitStoreUnavailable,
    JwtInvalid,
    InsufficientPermissions,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::GraphCycle => "GRAPH_CYCLE",
            ErrorKind::EdgeDangling => "EDGE_DANGLING",
            ErrorKind::ConfigInvalid => "CONFIG_INVALID",
            ErrorKind::HandlerMissing => "HANDLER_MISSING",
            ErrorKind::HandlerTimeout => "HANDLER_TIMEOUT",
            ErrorKind::HandlerFailed => "HANDLER_FAILED",
            ErrorKind::GuardBlocked => "GUARD_BLOCKED",
            ErrorKind::GuardDelayed => "GUARD_DELAYED",
            ErrorKind::RateLimitStoreUnavailable => "RATE_LIMIT_STORE_UNAVAILABLE",
            ErrorKind::JwtInvalid => "JWT_INVALID",
            ErrorKind::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// The one error currency of the crate.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Static graph contains a directed cycle.
    #[error("graph contains a cycle: {0:?}")]
    GraphCycle(Vec<String>),

    /// An edge references a node id that doesn't exist.
    #[error("edge '{edge}' references non-existent node '{node}'")]
    EdgeDangling { edge: String, node: String },

    /// Config failed bounds validation.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// No handler registered for the node's handler id.
    #[error("no handler registered for '{0}'")]
    HandlerMissing(String),

    /// The handler did not return within the effective timeout.
    #[error("node '{node}' timed out after {timeout_secs}s")]
    HandlerTimeout { node: String, timeout_secs: u64 },

    /// The handler returned an error.
    #[error("node '{node}' failed: {message}")]
    HandlerFailed { node: String, message: String },

    /// A guard returned `block`.
    #[error("guard '{guard}' blocked node '{node}': {reason}")]
    GuardBlocked {
        guard: String,
        node: String,
        reason: String,
    },

    /// A guard returned `delay` and the retry budget was exhausted while waiting.
    #[error("guard '{guard}' delayed node '{node}' (retry_after_ms={retry_after_ms})")]
    GuardDelayed {
        guard: String,
        node: String,
        retry_after_ms: u64,
    },

    /// The shared rate-limit store was unreachable (fail-strict mode, or fail-open
    /// timeout exceeded).
    #[error("rate limit store unavailable for node '{0}'")]
    RateLimitStoreUnavailable(String),

    /// JWT verification failed.
    #[error("jwt invalid: {0}")]
    JwtInvalid(String),

    /// RBAC check failed: user's effective roles/permissions did not satisfy the guard.
    #[error("insufficient permissions for node '{node}': {reason}")]
    InsufficientPermissions { node: String, reason: String },

    /// Execution was cancelled.
    #[error("execution cancelled")]
    Cancelled,

    /// A state-machine invariant was violated. Always an implementation bug.
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl GraphError {
    /// The stable, message-independent discriminant for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::GraphCycle(_) => ErrorKind::GraphCycle,
            GraphError::EdgeDangling { .. } => ErrorKind::EdgeDangling,
            GraphError::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            GraphError::HandlerMissing(_) => ErrorKind::HandlerMissing,
            GraphError::HandlerTimeout { .. } => ErrorKind::HandlerTimeout,
            GraphError::HandlerFailed { .. } => ErrorKind::HandlerFailed,
            GraphError::GuardBlocked { .. } => ErrorKind::GuardBlocked,
            GraphError::GuardDelayed { .. } => ErrorKind::GuardDelayed,
            GraphError::RateLimitStoreUnavailable(_) => ErrorKind::RateLimitStoreUnavailable,
            GraphError::JwtInvalid(_) => ErrorKind::JwtInvalid,
            GraphError::InsufficientPermissions { .. } => ErrorKind::InsufficientPermissions,
            GraphError::Cancelled => ErrorKind::Cancelled,
            GraphError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn node_execution(node: impl Into<String>, error: impl fmt::Display) -> Self {
        GraphError::HandlerFailed {
            node: node.into(),
            message: error.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
