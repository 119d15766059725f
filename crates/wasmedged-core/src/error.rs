//! Error taxonomy for supervisor operations.
//!
//! None of these cross the control surface as errors: the control layer folds
//! every failure into the boolean/string/int result contract. They exist so
//! the supervisor and its tests can distinguish failure modes precisely.

use thiserror::Error;

/// Errors from supervisor lifecycle operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A start was requested while a server session is active.
    #[error("API server is already running")]
    AlreadyRunning,

    /// A stop was requested with no active session.
    #[error("API server is not running")]
    NotRunning,

    /// The child could not be spawned (binary missing, staging failure).
    #[error("Failed to start: {0}")]
    SpawnFailure(String),

    /// The monitor observed a confirmed child exit.
    #[error("Server process died unexpectedly")]
    ProcessDied,

    /// The child is alive but its endpoint does not answer. Informational;
    /// never triggers corrective action.
    #[error("Server not responding")]
    ServerUnresponsive,

    /// IO error on a lifecycle path.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_stable() {
        assert_eq!(
            SupervisorError::AlreadyRunning.to_string(),
            "API server is already running"
        );
        assert_eq!(
            SupervisorError::SpawnFailure("binary not found".into()).to_string(),
            "Failed to start: binary not found"
        );
    }
}
