use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, HostingError>;

/// Error taxonomy for the hosting core.
///
/// `Spawn` and `Handshake` are recovered inside the process registry
/// (restart-or-give-up); callers above the registry only ever observe
/// `Unavailable`. `ToolFailed` is the per-call boundary: one bad tool call
/// surfaces as a failure string without killing the session or the bridge.
#[derive(Debug, Error)]
pub enum HostingError {
    /// Executable missing or the child process could not be started.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// The initialize handshake failed under both wire framings.
    #[error("initialize handshake failed: {0}")]
    Handshake(String),

    /// The peer returned a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// No response arrived within the request's timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// A tool executed and reported failure (non-fatal, per-call).
    #[error("tool execution failed: {0}")]
    ToolFailed(String),

    /// The connector cannot currently be reached or built.
    #[error("connector unavailable: {0}")]
    Unavailable(String),

    /// No connector/action/session matched the request.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid connector configuration (bad command vector, disabled, ...).
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl HostingError {
    /// Whether this error should be reported to clients as "unavailable"
    /// rather than as a caller mistake.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            HostingError::Spawn(_)
                | HostingError::Handshake(_)
                | HostingError::Timeout(_)
                | HostingError::Unavailable(_)
        )
    }
}
