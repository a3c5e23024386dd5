use thiserror::Error;

/// Canonical Kite error taxonomy used across crates.
///
/// Classification guidance:
/// - [`KiteError::Planning`]: fragment/host/assignment problems discovered before dispatch
/// - [`KiteError::Execution`]: failures reported by a running fragment instance
/// - [`KiteError::Transport`]: RPC connection/send failures (retriable once after a
///   client reopen at the call site)
/// - [`KiteError::Cancelled`]: the query was cancelled; distinguished from errors so
///   callers can tell teardown from failure
/// - [`KiteError::Io`]: raw filesystem IO failures from std APIs
/// - [`KiteError::Internal`]: broken coordinator invariants (bugs, not user input)
#[derive(Debug, Error)]
pub enum KiteError {
    /// Fragment-plan or placement problems found while assigning execution hosts.
    ///
    /// Examples:
    /// - instance-id space exhausted for the query id
    /// - cluster scheduler returned a malformed host mapping
    /// - fragment graph references a missing destination fragment
    #[error("planning error: {0}")]
    Planning(String),

    /// Runtime failures reported after dispatch succeeded.
    ///
    /// Examples:
    /// - a remote fragment instance reported a non-OK status
    /// - the local root fragment failed while producing batches
    #[error("execution error: {0}")]
    Execution(String),

    /// RPC transport failures (connect, send, or broken channel).
    ///
    /// Dispatch and cancellation retry exactly once after reopening the client;
    /// a second transport failure surfaces as this error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The query was cancelled, either by the caller or by internal teardown.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Coordinator invariant violations.
    ///
    /// Examples:
    /// - a status report naming an unknown backend number
    /// - bookkeeping counters going negative
    #[error("internal error: {0}")]
    Internal(String),
}

/// Standard Kite result alias.
pub type Result<T> = std::result::Result<T, KiteError>;
