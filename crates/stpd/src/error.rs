//! Error types for stpd.

use thiserror::Error;

/// Errors produced by the STP engine and its collaborators.
///
/// Every variant maps onto one of the error kinds in the design: callbacks
/// never let an error cross the event-loop boundary, so each of these is
/// either absorbed locally (counter bump + log) or rejects the triggering
/// message outright.
#[derive(Error, Debug)]
pub enum StpError {
    /// Bad VLAN id, bad instance index, unknown interface name, malformed
    /// IPC body. Recovered locally: message dropped, counter incremented.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A BPDU failed the accept predicate in the codec.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// LAG id pool empty, instance array full. The offending config is
    /// rejected; no state changes are applied.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Enabling an instance that is already active, deleting an unknown
    /// VLAN. Idempotent: callers should treat this as success.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Send/recv errors on packet, IPC, or netlink sockets.
    #[error("transport error: {0}")]
    Transport(String),

    /// Allocation failures during initialization, event-base creation,
    /// socket creation. The process aborts after logging.
    #[error("fatal: {0}")]
    Fatal(String),

    /// IO error, wrapped for `?` convenience at the transport boundary.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StpError {
    /// Returns true if the condition that produced this error can be
    /// treated as a no-op by the caller (§7 `StateConflict` is idempotent).
    pub fn is_idempotent(&self) -> bool {
        matches!(self, StpError::StateConflict(_))
    }

    /// Returns true for errors that should terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StpError::Fatal(_))
    }
}

/// Result type used throughout stpd.
pub type Result<T> = std::result::Result<T, StpError>;
