//! Lifecycle states, steps and the instance descriptor.

use crate::error::FixtureError;
use crate::runtime::{ContainerHandle, ImageRef};

/// Where a fixture is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Constructed, nothing allocated yet.
    Created,
    /// Acquiring the image.
    Pulling,
    /// Creating and starting the container.
    Starting,
    /// Polling the database.
    AwaitingReady,
    /// Database answered; before hook pending.
    Ready,
    /// Handed to the caller.
    Active,
    /// Tearing down.
    Stopping,
    /// Torn down. Terminal.
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Pulling => "pulling",
            LifecycleState::Starting => "starting",
            LifecycleState::AwaitingReady => "awaiting-ready",
            LifecycleState::Ready => "ready",
            LifecycleState::Active => "active",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        match (self, next) {
            (Created, Pulling) | (Created, Stopped) => true,
            (Pulling, Starting) => true,
            (Starting, AwaitingReady) => true,
            (AwaitingReady, Ready) => true,
            (Ready, Active) => true,
            // A failed start leaves the fixture in the failing phase; it can
            // still be shut down from there.
            (Pulling | Starting | AwaitingReady | Ready | Active, Stopping) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An individual operation within `start` or `shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Allocate,
    Pull,
    Create,
    Start,
    WaitReady,
    BeforeHook,
    AfterHook,
    Stop,
    Remove,
    Logs,
    Shutdown,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Step::Allocate => "allocate port",
            Step::Pull => "pull image",
            Step::Create => "create container",
            Step::Start => "start container",
            Step::WaitReady => "wait for readiness",
            Step::BeforeHook => "before hook",
            Step::AfterHook => "after hook",
            Step::Stop => "stop container",
            Step::Remove => "remove container",
            Step::Logs => "read container logs",
            Step::Shutdown => "shut down",
        };
        f.write_str(name)
    }
}

/// In-memory record of one ephemeral database container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescriptor {
    /// Generated container name.
    pub name: String,
    /// Image the container runs.
    pub image: ImageRef,
    /// Host port, once allocated. Never changes afterwards.
    pub port: Option<u16>,
    pub state: LifecycleState,
    /// Created container, until it is removed.
    pub container: Option<ContainerHandle>,
}

impl InstanceDescriptor {
    pub fn new(prefix: &str, image: ImageRef) -> Self {
        Self {
            name: format!("{}-{}", prefix, uuid::Uuid::new_v4()),
            image,
            port: None,
            state: LifecycleState::Created,
            container: None,
        }
    }
}

/// A reported-only failure collected during `shutdown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: Step,
    pub message: String,
}

/// What went wrong during `shutdown`, if anything.
///
/// Teardown never fails outright; every failure is logged and listed here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub failures: Vec<StepFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self, step: Step) -> bool {
        self.failures.iter().any(|f| f.step == step)
    }

    pub(crate) fn push(&mut self, step: Step, error: &FixtureError) {
        self.failures.push(StepFailure {
            step,
            message: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            Created,
            Pulling,
            Starting,
            AwaitingReady,
            Ready,
            Active,
            Stopping,
            Stopped,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_stopped_is_terminal() {
        for next in [Created, Pulling, Starting, Active, Stopping, Stopped] {
            assert!(!Stopped.can_transition_to(next));
        }
    }

    #[test]
    fn test_no_skipping_readiness() {
        assert!(!Starting.can_transition_to(Ready));
        assert!(!AwaitingReady.can_transition_to(Active));
        assert!(!Created.can_transition_to(Active));
    }

    #[test]
    fn test_descriptor_names_are_unique() {
        let image = ImageRef::new("postgres", "latest");
        let a = InstanceDescriptor::new("postgres", image.clone());
        let b = InstanceDescriptor::new("postgres", image);

        assert!(a.name.starts_with("postgres-"));
        assert_ne!(a.name, b.name);
        assert_eq!(a.state, Created);
        assert_eq!(a.port, None);
    }

    #[test]
    fn test_teardown_report() {
        let mut report = TeardownReport::default();
        assert!(report.is_clean());

        report.push(
            Step::Stop,
            &FixtureError::Teardown {
                step: Step::Stop,
                name: "postgres-1".to_string(),
                reason: "timeout".to_string(),
            },
        );
        assert!(!report.is_clean());
        assert!(report.failed(Step::Stop));
        assert!(!report.failed(Step::Remove));
    }
}
