//! Fixture event reporting.
//!
//! The fixture never logs through a global; it reports [`FixtureEvent`]s to
//! the [`FixtureLog`] it was constructed with. [`TracingLog`] (the default)
//! forwards them to `tracing`, [`NoopLog`] drops them.

use crate::error::FixtureError;
use crate::fixture::{LifecycleState, Step};
use crate::readiness::ProbeAttempt;
use crate::runtime::{ContainerHandle, ImageRef, PullProgress};

/// Something worth reporting during a fixture's lifecycle.
#[derive(Debug)]
pub enum FixtureEvent<'a> {
    /// The fixture moved to a new lifecycle state.
    Transition {
        name: &'a str,
        from: LifecycleState,
        to: LifecycleState,
    },
    /// One message from the image pull stream.
    PullProgress {
        image: &'a ImageRef,
        progress: &'a PullProgress,
    },
    /// The container exists and is bound to `port`.
    ContainerCreated {
        handle: &'a ContainerHandle,
        port: u16,
    },
    /// The preferred host port was taken and another was leased instead.
    PortFallback { preferred: u16, port: u16 },
    /// A non-fatal warning from the container runtime.
    RuntimeWarning { name: &'a str, message: &'a str },
    /// A readiness probe finished.
    ProbeAttempt(&'a ProbeAttempt),
    /// A step failed. Fatal or reported-only, see [`FixtureError::is_fatal`].
    StepFailed {
        step: Step,
        error: &'a FixtureError,
    },
    /// Tail of container output, captured for diagnostics.
    ContainerLogs { name: &'a str, lines: &'a [String] },
    /// The fixture was dropped without `shutdown()`.
    Leaked { name: &'a str, state: LifecycleState },
}

impl std::fmt::Display for FixtureEvent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FixtureEvent::Transition { name, from, to } => {
                write!(f, "{}: {} -> {}", name, from, to)
            }
            FixtureEvent::PullProgress { image, progress } => {
                write!(f, "pull {}: {}", image, progress)
            }
            FixtureEvent::ContainerCreated { handle, port } => {
                write!(f, "created container {} on port {}", handle.name, port)
            }
            FixtureEvent::PortFallback { preferred, port } => {
                write!(f, "preferred port {} unavailable, using {}", preferred, port)
            }
            FixtureEvent::RuntimeWarning { name, message } => {
                write!(f, "runtime warning for {}: {}", name, message)
            }
            FixtureEvent::ProbeAttempt(attempt) => match &attempt.outcome {
                Ok(()) => write!(
                    f,
                    "probe {} succeeded after {:?}",
                    attempt.attempt, attempt.elapsed
                ),
                Err(e) if attempt.will_retry => write!(
                    f,
                    "probe {} failed after {:?}, going to retry: {}",
                    attempt.attempt, attempt.elapsed, e
                ),
                Err(e) => write!(
                    f,
                    "probe {} failed after {:?}: {}",
                    attempt.attempt, attempt.elapsed, e
                ),
            },
            FixtureEvent::StepFailed { step, error } => write!(f, "[{}] {}", step, error),
            FixtureEvent::ContainerLogs { name, lines } => {
                write!(f, "last {} log lines of {}", lines.len(), name)?;
                for line in lines.iter() {
                    write!(f, "\n  {}", line)?;
                }
                Ok(())
            }
            FixtureEvent::Leaked { name, state } => write!(
                f,
                "fixture {} dropped in state {} without shutdown(), container may remain running",
                name, state
            ),
        }
    }
}

/// Sink for fixture events.
pub trait FixtureLog: Send + Sync {
    fn record(&self, event: &FixtureEvent<'_>);
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl FixtureLog for TracingLog {
    fn record(&self, event: &FixtureEvent<'_>) {
        match event {
            FixtureEvent::Transition { to, .. } => match to {
                LifecycleState::Active | LifecycleState::Stopped => tracing::info!("{}", event),
                _ => tracing::debug!("{}", event),
            },
            FixtureEvent::PullProgress { .. } => tracing::trace!("{}", event),
            FixtureEvent::ContainerCreated { .. } => tracing::info!("{}", event),
            FixtureEvent::PortFallback { .. } => tracing::info!("{}", event),
            FixtureEvent::RuntimeWarning { .. } => tracing::warn!("{}", event),
            FixtureEvent::ProbeAttempt(attempt) => {
                if attempt.outcome.is_ok() {
                    tracing::info!("{}", event)
                } else {
                    tracing::debug!("{}", event)
                }
            }
            FixtureEvent::StepFailed { error, .. } => {
                if error.is_fatal() {
                    tracing::error!("{}", event)
                } else {
                    tracing::warn!("{}", event)
                }
            }
            FixtureEvent::ContainerLogs { .. } => tracing::warn!("{}", event),
            FixtureEvent::Leaked { .. } => tracing::warn!("{}", event),
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLog;

impl FixtureLog for NoopLog {
    fn record(&self, _event: &FixtureEvent<'_>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::readiness::ProbeError;

    #[test]
    fn test_event_messages() {
        let failed = ProbeAttempt {
            attempt: 2,
            elapsed: Duration::from_secs(1),
            outcome: Err(ProbeError::Connect("connection refused".to_string())),
            will_retry: true,
        };
        assert_eq!(
            FixtureEvent::ProbeAttempt(&failed).to_string(),
            "probe 2 failed after 1s, going to retry: connection failed: connection refused"
        );
        let last = ProbeAttempt {
            will_retry: false,
            ..failed
        };
        assert_eq!(
            FixtureEvent::ProbeAttempt(&last).to_string(),
            "probe 2 failed after 1s: connection failed: connection refused"
        );

        let error = FixtureError::Hook {
            step: Step::BeforeHook,
            reason: "schema exists".to_string(),
        };
        let event = FixtureEvent::StepFailed {
            step: Step::BeforeHook,
            error: &error,
        };
        assert_eq!(
            event.to_string(),
            "[before hook] before hook failed: schema exists"
        );
    }

    #[test]
    fn test_container_logs_message_lists_lines() {
        let lines = vec![
            "FATAL: password authentication failed".to_string(),
            "LOG: shutting down".to_string(),
        ];
        let event = FixtureEvent::ContainerLogs {
            name: "postgres-1",
            lines: &lines,
        };
        let message = event.to_string();
        assert!(message.starts_with("last 2 log lines of postgres-1"));
        assert!(message.contains("\n  LOG: shutting down"));
    }

    #[test]
    fn test_loggers_accept_every_event() {
        let lines: Vec<String> = Vec::new();
        let event = FixtureEvent::ContainerLogs {
            name: "postgres-1",
            lines: &lines,
        };
        TracingLog.record(&event);
        NoopLog.record(&event);
    }
}
