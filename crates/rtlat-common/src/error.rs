use thiserror::Error;

/// Probe error types covering configuration, bootstrap, and runtime failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LatError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The named shared metrics region could not be created, sized, or mapped.
    #[error("shared memory {name}: {op} failed: {reason}")]
    SharedMemory {
        /// Logical name of the region.
        name: String,
        /// Operation that failed (open, size, map, unlink).
        op: &'static str,
        /// OS error description.
        reason: String,
    },

    /// Real-time scheduling attributes could not be acquired.
    #[error("scheduling error: {0}")]
    Scheduling(String),

    /// A measuring thread could not be created or joined.
    #[error("thread error: {0}")]
    Thread(String),

    /// Periodic payload or loopback device failure.
    #[error("payload error: {0}")]
    Payload(String),

    /// I/O operation error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl From<std::io::Error> for LatError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Convenience type alias for probe operations.
pub type LatResult<T> = Result<T, LatError>;
