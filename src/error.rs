//! Error types for fixture provisioning.

use std::time::Duration;

use thiserror::Error;

use crate::fixture::{LifecycleState, Step};

/// Result type for fixture operations.
pub type Result<T> = std::result::Result<T, FixtureError>;

/// Configuration errors, raised before any lifecycle step runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A setting is present but malformed.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// A setting is required but absent.
    #[error("Missing required setting {key}: {hint}")]
    MissingRequired { key: String, hint: String },
}

/// Errors that can occur while provisioning or tearing down a fixture.
///
/// `Start`, `Hook`, `Teardown` and `Logs` are only ever reported through the
/// fixture log and the [`TeardownReport`](crate::fixture::TeardownReport);
/// `start()` never returns them.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// No host port could be reserved.
    #[error("Failed to allocate a host port (preferred {preferred:?}): {reason}")]
    Allocation {
        /// Port that was tried first.
        preferred: Option<u16>,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to pull the image.
    #[error("Failed to pull image '{image}': {reason}")]
    Pull {
        /// Image reference.
        image: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to create the container.
    #[error("Failed to create container '{name}': {reason}")]
    Create {
        /// Container name.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// The runtime reported a start failure.
    #[error("Failed to start container '{name}': {reason}")]
    Start {
        /// Container name.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// The database never answered a liveness query.
    #[error(
        "Database on port {port} not ready within {timeout:?} after {attempts} attempts: {last_error}"
    )]
    ReadinessTimeout {
        /// Host port that was probed.
        port: u16,
        /// Configured readiness timeout.
        timeout: Duration,
        /// Number of probe attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },

    /// A caller-supplied hook failed or panicked.
    #[error("{step} failed: {reason}")]
    Hook {
        /// Which hook.
        step: Step,
        /// Reason for failure.
        reason: String,
    },

    /// Stopping or removing the container failed.
    #[error("{step} failed for '{name}': {reason}")]
    Teardown {
        /// Stop or remove.
        step: Step,
        /// Container name.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// Container output could not be read.
    #[error("Failed to read logs of container '{name}': {reason}")]
    Logs {
        /// Container name.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// Operation called in a state that does not allow it.
    #[error("Cannot {operation} a fixture in state {state}")]
    InvalidState {
        /// Operation attempted.
        operation: &'static str,
        /// State the fixture was in.
        state: LifecycleState,
    },

    /// The Docker endpoint could not be used.
    #[error("Docker not available: {reason}")]
    DockerNotAvailable {
        /// Reason why Docker is unavailable.
        reason: String,
    },

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl FixtureError {
    /// Whether this error aborts `start()` when it occurs there.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            FixtureError::Start { .. }
                | FixtureError::Hook { .. }
                | FixtureError::Teardown { .. }
                | FixtureError::Logs { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_only_errors_are_not_fatal() {
        let start = FixtureError::Start {
            name: "postgres-x".to_string(),
            reason: "boom".to_string(),
        };
        let hook = FixtureError::Hook {
            step: Step::BeforeHook,
            reason: "boom".to_string(),
        };
        let teardown = FixtureError::Teardown {
            step: Step::Stop,
            name: "postgres-x".to_string(),
            reason: "boom".to_string(),
        };

        assert!(!start.is_fatal());
        assert!(!hook.is_fatal());
        assert!(!teardown.is_fatal());
    }

    #[test]
    fn test_phase_errors_are_fatal() {
        let pull = FixtureError::Pull {
            image: "postgres:latest".to_string(),
            reason: "manifest unknown".to_string(),
        };
        let timeout = FixtureError::ReadinessTimeout {
            port: 5432,
            timeout: Duration::from_secs(20),
            attempts: 20,
            last_error: "connection refused".to_string(),
        };

        assert!(pull.is_fatal());
        assert!(timeout.is_fatal());
    }

    #[test]
    fn test_messages_name_the_failing_operation() {
        let err = FixtureError::Teardown {
            step: Step::Remove,
            name: "postgres-x".to_string(),
            reason: "no such container".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "remove container failed for 'postgres-x': no such container"
        );

        let err: FixtureError = ConfigError::InvalidValue {
            key: "DOCKER_HOST".to_string(),
            message: "expected host:port".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Invalid value for DOCKER_HOST: expected host:port"
        );
    }
}
