//! Test doubles for driving a [`PostgresFixture`](crate::fixture::PostgresFixture)
//! without Docker or a database.
//!
//! Provides:
//! - [`StubRuntime`]: a container runtime with per-step failure switches
//! - [`ScriptedProbe`]: a readiness probe that fails a set number of times
//! - [`RecordingHooks`]: hooks that count calls and can fail or panic
//! - [`RecordingLog`]: a fixture log that keeps every event
//! - [`Timeline`]: a shared, ordered record of what all of the above did
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dockerized_postgres::fixture::PostgresFixture;
//! use dockerized_postgres::testing::{ScriptedProbe, StubRuntime};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let mut fixture = PostgresFixture::builder(Arc::new(StubRuntime::default()))
//!         .probe(Arc::new(ScriptedProbe::failing_times(2)))
//!         .build()
//!         .unwrap();
//!     let conn = fixture.start().await.unwrap();
//!     // ...
//!     fixture.shutdown().await;
//! }
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};

use crate::connection::ConnectionInfo;
use crate::error::{FixtureError, Result};
use crate::fixture::{LifecycleHooks, LifecycleState, Step};
use crate::log::{FixtureEvent, FixtureLog};
use crate::readiness::{ProbeError, ReadinessProbe};
use crate::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec, ImageRef, PullProgress};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking hook must not take the recorders down with it.
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Ordered record shared between stubs, for asserting on call order.
#[derive(Debug, Clone, Default)]
pub struct Timeline(Arc<Mutex<Vec<String>>>);

impl Timeline {
    pub fn push(&self, entry: impl Into<String>) {
        lock(&self.0).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    /// Index of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        lock(&self.0).iter().position(|e| e == entry)
    }
}

/// A container runtime stub.
///
/// Each call is recorded by operation name (`pull`, `image_exists`,
/// `create`, `start`, `stop`, `remove`, `logs`). Steps listed via
/// [`failing`](Self::failing) return an error.
#[derive(Default)]
pub struct StubRuntime {
    calls: Mutex<Vec<String>>,
    timeline: Option<Timeline>,
    failing: HashSet<Step>,
    pull_events: Vec<PullProgress>,
    image_present: bool,
    hanging_pull: bool,
    log_lines: Vec<String>,
    create_warnings: Vec<String>,
    last_spec: Mutex<Option<ContainerSpec>>,
}

impl StubRuntime {
    /// Make `step` fail. Accepts `Pull`, `Create`, `Start`, `Stop`,
    /// `Remove` and `Logs`.
    pub fn failing(mut self, step: Step) -> Self {
        self.failing.insert(step);
        self
    }

    /// Also record calls into a shared timeline.
    pub fn with_timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = Some(timeline);
        self
    }

    /// Progress messages yielded by `pull_image`.
    pub fn with_pull_events(mut self, events: Vec<PullProgress>) -> Self {
        self.pull_events = events;
        self
    }

    /// Report the image as already present.
    pub fn with_image_present(mut self) -> Self {
        self.image_present = true;
        self
    }

    /// Make `pull_image` return a stream that never ends.
    pub fn with_hanging_pull(mut self) -> Self {
        self.hanging_pull = true;
        self
    }

    /// Output returned by `container_logs`.
    pub fn with_log_lines(mut self, lines: &[&str]) -> Self {
        self.log_lines = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    /// Warnings attached to the handle `create_container` returns.
    pub fn with_create_warnings(mut self, warnings: &[&str]) -> Self {
        self.create_warnings = warnings.iter().map(|w| w.to_string()).collect();
        self
    }

    /// Operations called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Number of times `op` was called.
    pub fn count(&self, op: &str) -> usize {
        lock(&self.calls).iter().filter(|c| *c == op).count()
    }

    /// Spec passed to the most recent `create_container`.
    pub fn last_spec(&self) -> Option<ContainerSpec> {
        lock(&self.last_spec).clone()
    }

    fn record(&self, op: &str) {
        lock(&self.calls).push(op.to_string());
        if let Some(timeline) = &self.timeline {
            timeline.push(op);
        }
    }

    fn fails(&self, step: Step) -> bool {
        self.failing.contains(&step)
    }
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    fn pull_image(&self, image: &ImageRef) -> BoxStream<'_, Result<PullProgress>> {
        self.record("pull");
        if self.hanging_pull {
            return stream::pending().boxed();
        }

        let mut items: Vec<Result<PullProgress>> =
            self.pull_events.iter().cloned().map(Ok).collect();
        if self.fails(Step::Pull) {
            items.push(Err(FixtureError::Pull {
                image: image.to_string(),
                reason: "manifest unknown".to_string(),
            }));
        }
        stream::iter(items).boxed()
    }

    async fn image_exists(&self, _image: &ImageRef) -> bool {
        self.record("image_exists");
        self.image_present
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.record("create");
        *lock(&self.last_spec) = Some(spec.clone());
        if self.fails(Step::Create) {
            return Err(FixtureError::Create {
                name: spec.name.clone(),
                reason: "port is already allocated".to_string(),
            });
        }
        Ok(ContainerHandle {
            id: format!("stub-{}", spec.name),
            name: spec.name.clone(),
            warnings: self.create_warnings.clone(),
        })
    }

    async fn start_container(&self, handle: &ContainerHandle) -> Result<()> {
        self.record("start");
        if self.fails(Step::Start) {
            return Err(FixtureError::Start {
                name: handle.name.clone(),
                reason: "container exited immediately".to_string(),
            });
        }
        Ok(())
    }

    async fn stop_container(&self, handle: &ContainerHandle) -> Result<()> {
        self.record("stop");
        if self.fails(Step::Stop) {
            return Err(FixtureError::Teardown {
                step: Step::Stop,
                name: handle.name.clone(),
                reason: "daemon timed out".to_string(),
            });
        }
        Ok(())
    }

    async fn remove_container(&self, handle: &ContainerHandle) -> Result<()> {
        self.record("remove");
        if self.fails(Step::Remove) {
            return Err(FixtureError::Teardown {
                step: Step::Remove,
                name: handle.name.clone(),
                reason: "no such container".to_string(),
            });
        }
        Ok(())
    }

    async fn container_logs(&self, handle: &ContainerHandle, tail: usize) -> Result<Vec<String>> {
        self.record("logs");
        if self.fails(Step::Logs) {
            return Err(FixtureError::Logs {
                name: handle.name.clone(),
                reason: "container is gone".to_string(),
            });
        }
        let skip = self.log_lines.len().saturating_sub(tail);
        Ok(self.log_lines[skip..].to_vec())
    }
}

/// A readiness probe that fails a scripted number of times.
pub struct ScriptedProbe {
    /// Failures before the first success; `None` never succeeds.
    failures: Option<u32>,
    calls: AtomicU32,
    timeline: Option<Timeline>,
}

impl ScriptedProbe {
    pub fn always_ok() -> Self {
        Self::failing_times(0)
    }

    /// Refuse every connection.
    pub fn always_failing() -> Self {
        Self {
            failures: None,
            calls: AtomicU32::new(0),
            timeline: None,
        }
    }

    /// Refuse the first `n` connections, then succeed.
    pub fn failing_times(n: u32) -> Self {
        Self {
            failures: Some(n),
            calls: AtomicU32::new(0),
            timeline: None,
        }
    }

    /// Record attempts into a shared timeline as `probe:ok` / `probe:fail`.
    pub fn with_timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = Some(timeline);
        self
    }

    /// Number of probes made.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReadinessProbe for ScriptedProbe {
    async fn probe(&self, _target: &ConnectionInfo) -> std::result::Result<(), ProbeError> {
        let attempt = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let ok = matches!(self.failures, Some(n) if attempt > n);
        if let Some(timeline) = &self.timeline {
            timeline.push(if ok { "probe:ok" } else { "probe:fail" });
        }
        if ok {
            Ok(())
        } else {
            Err(ProbeError::Connect("connection refused".to_string()))
        }
    }
}

/// Hooks that count their calls and can be told to fail or panic.
#[derive(Default)]
pub struct RecordingHooks {
    before_calls: AtomicU32,
    after_calls: AtomicU32,
    fail_before: bool,
    fail_after: bool,
    panic_before: bool,
    seen: Mutex<Vec<ConnectionInfo>>,
    timeline: Option<Timeline>,
}

impl RecordingHooks {
    pub fn fail_before(mut self) -> Self {
        self.fail_before = true;
        self
    }

    pub fn fail_after(mut self) -> Self {
        self.fail_after = true;
        self
    }

    pub fn panic_before(mut self) -> Self {
        self.panic_before = true;
        self
    }

    /// Record calls into a shared timeline as `before` / `after`.
    pub fn with_timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = Some(timeline);
        self
    }

    pub fn before_calls(&self) -> u32 {
        self.before_calls.load(Ordering::Relaxed)
    }

    pub fn after_calls(&self) -> u32 {
        self.after_calls.load(Ordering::Relaxed)
    }

    /// Connection info passed to each call, in order.
    pub fn seen(&self) -> Vec<ConnectionInfo> {
        lock(&self.seen).clone()
    }

    fn record(&self, which: &str, conn: &ConnectionInfo) {
        lock(&self.seen).push(conn.clone());
        if let Some(timeline) = &self.timeline {
            timeline.push(which);
        }
    }
}

#[async_trait]
impl LifecycleHooks for RecordingHooks {
    async fn before(&self, conn: &ConnectionInfo) -> anyhow::Result<()> {
        self.before_calls.fetch_add(1, Ordering::Relaxed);
        self.record("before", conn);
        if self.panic_before {
            panic!("before hook exploded");
        }
        if self.fail_before {
            anyhow::bail!("relation \"users\" already exists");
        }
        Ok(())
    }

    async fn after(&self, conn: &ConnectionInfo) -> anyhow::Result<()> {
        self.after_calls.fetch_add(1, Ordering::Relaxed);
        self.record("after", conn);
        if self.fail_after {
            anyhow::bail!("pool close timed out");
        }
        Ok(())
    }
}

/// A recorded fixture event, owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Transition(LifecycleState),
    Pull(String),
    Created { name: String, port: u16 },
    PortFallback { preferred: u16, port: u16 },
    Warning(String),
    Probe { attempt: u32, ok: bool, retry: bool },
    Failed { step: Step, fatal: bool, message: String },
    Logs(Vec<String>),
    Leaked(LifecycleState),
}

/// A fixture log that keeps every event.
#[derive(Default)]
pub struct RecordingLog {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingLog {
    pub fn events(&self) -> Vec<Recorded> {
        lock(&self.events).clone()
    }

    /// States entered, in order.
    pub fn transitions(&self) -> Vec<LifecycleState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Transition(to) => Some(to),
                _ => None,
            })
            .collect()
    }

    /// Outcome of each probe attempt, in order.
    pub fn probe_outcomes(&self) -> Vec<bool> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Probe { ok, .. } => Some(ok),
                _ => None,
            })
            .collect()
    }

    /// Whether each readiness attempt announced another one.
    pub fn announced_retries(&self) -> Vec<bool> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Probe { retry, .. } => Some(retry),
                _ => None,
            })
            .collect()
    }

    /// Failed steps with their messages.
    pub fn failures(&self) -> Vec<(Step, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Failed { step, message, .. } => Some((step, message)),
                _ => None,
            })
            .collect()
    }

    /// Runtime warnings, in order.
    pub fn warnings(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Warning(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    /// Container log lines reported, if any.
    pub fn container_logs(&self) -> Option<Vec<String>> {
        self.events().into_iter().find_map(|e| match e {
            Recorded::Logs(lines) => Some(lines),
            _ => None,
        })
    }

    pub fn leaked(&self) -> bool {
        self.events()
            .iter()
            .any(|e| matches!(e, Recorded::Leaked(_)))
    }
}

impl FixtureLog for RecordingLog {
    fn record(&self, event: &FixtureEvent<'_>) {
        let recorded = match event {
            FixtureEvent::Transition { to, .. } => Recorded::Transition(*to),
            FixtureEvent::PullProgress { progress, .. } => Recorded::Pull(progress.to_string()),
            FixtureEvent::ContainerCreated { handle, port } => Recorded::Created {
                name: handle.name.clone(),
                port: *port,
            },
            FixtureEvent::PortFallback { preferred, port } => Recorded::PortFallback {
                preferred: *preferred,
                port: *port,
            },
            FixtureEvent::RuntimeWarning { message, .. } => Recorded::Warning(message.to_string()),
            FixtureEvent::ProbeAttempt(attempt) => Recorded::Probe {
                attempt: attempt.attempt,
                ok: attempt.outcome.is_ok(),
                retry: attempt.will_retry,
            },
            FixtureEvent::StepFailed { step, error } => Recorded::Failed {
                step: *step,
                fatal: error.is_fatal(),
                message: error.to_string(),
            },
            FixtureEvent::ContainerLogs { lines, .. } => Recorded::Logs(lines.to_vec()),
            FixtureEvent::Leaked { state, .. } => Recorded::Leaked(*state),
        };
        lock(&self.events).push(recorded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    fn conn() -> ConnectionInfo {
        ConnectionInfo::new("localhost", 15432, &Credentials::default())
    }

    #[tokio::test]
    async fn test_scripted_probe_counts_and_switches() {
        let probe = ScriptedProbe::failing_times(1);
        assert!(probe.probe(&conn()).await.is_err());
        assert!(probe.probe(&conn()).await.is_ok());
        assert!(probe.probe(&conn()).await.is_ok());
        assert_eq!(probe.calls(), 3);

        let never = ScriptedProbe::always_failing();
        let err = never.probe(&conn()).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_stub_runtime_pull_stream() {
        let runtime = StubRuntime::default()
            .with_pull_events(vec![PullProgress {
                status: "Pull complete".to_string(),
                ..Default::default()
            }])
            .failing(Step::Pull);
        let image = ImageRef::new("postgres", "latest");

        let items: Vec<_> = runtime.pull_image(&image).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(FixtureError::Pull { .. })));
        assert_eq!(runtime.calls(), vec!["pull".to_string()]);
    }

    #[tokio::test]
    async fn test_stub_runtime_log_tail() {
        let runtime = StubRuntime::default().with_log_lines(&["one", "two", "three"]);
        let handle = ContainerHandle {
            id: "id".to_string(),
            name: "postgres-1".to_string(),
            warnings: Vec::new(),
        };
        let lines = runtime.container_logs(&handle, 2).await.unwrap();
        assert_eq!(lines, vec!["two".to_string(), "three".to_string()]);
    }

    #[tokio::test]
    async fn test_shared_timeline_orders_across_stubs() {
        let timeline = Timeline::default();
        let probe = ScriptedProbe::always_ok().with_timeline(timeline.clone());
        let hooks = RecordingHooks::default().with_timeline(timeline.clone());

        probe.probe(&conn()).await.unwrap();
        hooks.before(&conn()).await.unwrap();

        assert_eq!(
            timeline.entries(),
            vec!["probe:ok".to_string(), "before".to_string()]
        );
        assert_eq!(timeline.position("before"), Some(1));
    }
}
