//! Ephemeral PostgreSQL container lifecycle.
//!
//! A [`PostgresFixture`] walks one container through
//! allocate → pull → create → start → wait for readiness → before hook, and
//! later after hook → stop → remove. Starting the container, both hooks and
//! both teardown steps are best-effort: their failures are logged and the
//! sequence carries on. Everything else aborts `start()`.

mod hooks;
mod state;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};

use crate::config::{FixtureConfig, LOOPBACK_IP, PullPolicy, RuntimeEndpoint};
use crate::connection::ConnectionInfo;
use crate::error::{FixtureError, Result};
use crate::log::{FixtureEvent, FixtureLog, TracingLog};
use crate::port::{PortAllocator, PortLease};
use crate::readiness::{PostgresProbe, ReadinessProbe, wait_ready};
use crate::runtime::{
    ContainerHandle, ContainerRuntime, ContainerSpec, DockerRuntime, FIXTURE_LABEL, ImageRef,
};

pub use hooks::{FnHooks, LifecycleHooks, NoHooks};
pub use state::{InstanceDescriptor, LifecycleState, Step, StepFailure, TeardownReport};

/// One ephemeral database container and its lifecycle.
///
/// `start` and `shutdown` take `&mut self`, so the steps of one fixture can
/// never interleave. Independent fixtures can run concurrently.
pub struct PostgresFixture {
    config: FixtureConfig,
    /// Host the database is reached on from this process.
    db_host: String,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn ReadinessProbe>,
    hooks: Arc<dyn LifecycleHooks>,
    log: Arc<dyn FixtureLog>,
    allocator: PortAllocator,
    descriptor: InstanceDescriptor,
    lease: Option<PortLease>,
}

impl PostgresFixture {
    /// Start building a fixture around an explicit runtime.
    pub fn builder(runtime: Arc<dyn ContainerRuntime>) -> PostgresFixtureBuilder {
        PostgresFixtureBuilder::new(runtime)
    }

    /// Resolve the Docker endpoint and `PG_FIXTURE_*` settings from the
    /// environment and wire up Docker and the Postgres probe.
    ///
    /// Configuration problems are reported here, before anything runs.
    pub fn from_env(hooks: impl LifecycleHooks + 'static) -> Result<Self> {
        let endpoint = RuntimeEndpoint::from_env()?;
        let config = FixtureConfig::from_env()?;
        Self::for_endpoint(&endpoint, config, Arc::new(hooks))
    }

    /// Build a Docker-backed fixture for `endpoint`.
    pub fn for_endpoint(
        endpoint: &RuntimeEndpoint,
        config: FixtureConfig,
        hooks: Arc<dyn LifecycleHooks>,
    ) -> Result<Self> {
        Self::with_docker(DockerRuntime::connect(endpoint)?, config, hooks)
    }

    /// Build a fixture around an already connected Docker client.
    ///
    /// The database is addressed through the daemon's host, and unless
    /// `config.host_ip` is set the port is published where that host can
    /// be reached.
    pub fn with_docker(
        runtime: DockerRuntime,
        mut config: FixtureConfig,
        hooks: Arc<dyn LifecycleHooks>,
    ) -> Result<Self> {
        let endpoint = runtime.endpoint();
        let db_host = endpoint.database_host().to_string();
        if config.host_ip.is_none() {
            config.host_ip = Some(endpoint.publish_ip().to_string());
        }
        let probe = PostgresProbe::new(config.connect_timeout);

        Self::builder(Arc::new(runtime))
            .config(config)
            .db_host(db_host)
            .probe(Arc::new(probe))
            .hooks(hooks)
            .build()
    }

    pub fn descriptor(&self) -> &InstanceDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> LifecycleState {
        self.descriptor.state
    }

    /// Host port, once allocated.
    pub fn port(&self) -> Option<u16> {
        self.descriptor.port
    }

    pub fn config(&self) -> &FixtureConfig {
        &self.config
    }

    /// Host the database is reached on from this process.
    pub fn db_host(&self) -> &str {
        &self.db_host
    }

    /// Connection details, once a port has been allocated.
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.descriptor
            .port
            .map(|port| ConnectionInfo::new(self.db_host.clone(), port, &self.config.credentials))
    }

    /// Bring the database up and run the before hook.
    ///
    /// On a fatal failure the fixture stays in the phase that failed and any
    /// container already created is left in place; call
    /// [`shutdown`](Self::shutdown) to clean up.
    pub async fn start(&mut self) -> Result<ConnectionInfo> {
        if self.descriptor.state != LifecycleState::Created {
            return Err(FixtureError::InvalidState {
                operation: "start",
                state: self.descriptor.state,
            });
        }

        let lease = self
            .allocator
            .allocate(self.config.preferred_port)
            .map_err(|e| self.fatal(Step::Allocate, e))?;
        let port = lease.port();
        if let Some(preferred) = self.config.preferred_port
            && preferred != 0
            && preferred != port
        {
            self.log
                .record(&FixtureEvent::PortFallback { preferred, port });
        }
        self.descriptor.port = Some(port);
        self.lease = Some(lease);
        let conn = ConnectionInfo::new(self.db_host.clone(), port, &self.config.credentials);

        self.transition(LifecycleState::Pulling);
        self.acquire_image()
            .await
            .map_err(|e| self.fatal(Step::Pull, e))?;

        self.transition(LifecycleState::Starting);
        let spec = self.container_spec(port);
        let handle = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| self.fatal(Step::Create, e))?;
        self.log.record(&FixtureEvent::ContainerCreated {
            handle: &handle,
            port,
        });
        for warning in &handle.warnings {
            self.log.record(&FixtureEvent::RuntimeWarning {
                name: &handle.name,
                message: warning,
            });
        }
        self.descriptor.container = Some(handle.clone());

        // The readiness wait decides whether the database actually came up.
        let _ = self
            .best_effort(Step::Start, self.runtime.start_container(&handle))
            .await;

        self.transition(LifecycleState::AwaitingReady);
        if let Err(e) = wait_ready(
            self.probe.as_ref(),
            &conn,
            self.config.readiness_timeout,
            self.config.probe_interval,
            self.log.as_ref(),
        )
        .await
        {
            let e = self.fatal(Step::WaitReady, e);
            self.report_container_logs(&handle).await;
            return Err(e);
        }

        self.transition(LifecycleState::Ready);
        let _ = self
            .call_hook(Step::BeforeHook, self.hooks.before(&conn))
            .await;

        self.transition(LifecycleState::Active);
        Ok(conn)
    }

    /// Run the after hook and remove the container.
    ///
    /// Never fails; suppressed failures are listed in the returned report.
    pub async fn shutdown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        match self.descriptor.state {
            LifecycleState::Stopped => {
                let e = FixtureError::InvalidState {
                    operation: "shut down",
                    state: LifecycleState::Stopped,
                };
                self.log.record(&FixtureEvent::StepFailed {
                    step: Step::Shutdown,
                    error: &e,
                });
                report.push(Step::Shutdown, &e);
                return report;
            }
            LifecycleState::Created => {
                self.transition(LifecycleState::Stopped);
                return report;
            }
            _ => {}
        }

        self.transition(LifecycleState::Stopping);

        if let Some(conn) = self.connection_info()
            && let Err(e) = self.call_hook(Step::AfterHook, self.hooks.after(&conn)).await
        {
            report.push(Step::AfterHook, &e);
        }

        if let Some(handle) = self.descriptor.container.take() {
            if let Err(e) = self
                .best_effort(Step::Stop, self.runtime.stop_container(&handle))
                .await
            {
                report.push(Step::Stop, &e);
            }
            if let Err(e) = self
                .best_effort(Step::Remove, self.runtime.remove_container(&handle))
                .await
            {
                report.push(Step::Remove, &e);
            }
        }

        self.lease = None;
        self.transition(LifecycleState::Stopped);
        report
    }

    fn transition(&mut self, to: LifecycleState) {
        let from = self.descriptor.state;
        debug_assert!(
            from.can_transition_to(to),
            "invalid transition {} -> {}",
            from,
            to
        );
        self.descriptor.state = to;
        self.log.record(&FixtureEvent::Transition {
            name: &self.descriptor.name,
            from,
            to,
        });
    }

    /// Report a failure that aborts `start()`.
    fn fatal(&self, step: Step, error: FixtureError) -> FixtureError {
        self.log.record(&FixtureEvent::StepFailed {
            step,
            error: &error,
        });
        error
    }

    /// Run a step whose failure is reported but does not abort the phase.
    async fn best_effort<T>(
        &self,
        step: Step,
        op: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let result = op.await;
        if let Err(error) = &result {
            self.log.record(&FixtureEvent::StepFailed { step, error });
        }
        result
    }

    /// Run a caller hook as a best-effort step, turning panics into errors.
    async fn call_hook(
        &self,
        step: Step,
        hook: impl Future<Output = anyhow::Result<()>>,
    ) -> Result<()> {
        let outcome = match AssertUnwindSafe(hook).catch_unwind().await {
            Ok(result) => result.map_err(|e| FixtureError::Hook {
                step,
                reason: format!("{:#}", e),
            }),
            Err(payload) => Err(FixtureError::Hook {
                step,
                reason: format!("panicked: {}", panic_message(payload.as_ref())),
            }),
        };
        self.best_effort(step, async move { outcome }).await
    }

    async fn acquire_image(&self) -> Result<()> {
        let image = &self.descriptor.image;
        if self.config.pull_policy == PullPolicy::IfMissing
            && self.runtime.image_exists(image).await
        {
            return Ok(());
        }

        let drain = async {
            let mut stream = self.runtime.pull_image(image);
            while let Some(progress) = stream.next().await {
                let progress = progress?;
                self.log.record(&FixtureEvent::PullProgress {
                    image,
                    progress: &progress,
                });
            }
            Ok::<(), FixtureError>(())
        };

        match tokio::time::timeout(self.config.pull_timeout, drain).await {
            Ok(result) => result,
            Err(_) => Err(FixtureError::Pull {
                image: image.to_string(),
                reason: format!("pull did not finish within {:?}", self.config.pull_timeout),
            }),
        }
    }

    fn container_spec(&self, host_port: u16) -> ContainerSpec {
        let credentials = &self.config.credentials;
        ContainerSpec {
            name: self.descriptor.name.clone(),
            image: self.descriptor.image.clone(),
            container_port: self.config.container_port,
            host_ip: self
                .config
                .host_ip
                .clone()
                .unwrap_or_else(|| LOOPBACK_IP.to_string()),
            host_port,
            env: vec![
                ("POSTGRES_USER".to_string(), credentials.user.clone()),
                ("POSTGRES_PASSWORD".to_string(), credentials.password.clone()),
                ("POSTGRES_DB".to_string(), credentials.database.clone()),
            ],
            labels: vec![(FIXTURE_LABEL.to_string(), "true".to_string())],
        }
    }

    async fn report_container_logs(&self, handle: &ContainerHandle) {
        if self.config.log_tail == 0 {
            return;
        }
        if let Ok(lines) = self
            .best_effort(
                Step::Logs,
                self.runtime.container_logs(handle, self.config.log_tail),
            )
            .await
        {
            self.log.record(&FixtureEvent::ContainerLogs {
                name: &handle.name,
                lines: &lines,
            });
        }
    }
}

impl Drop for PostgresFixture {
    fn drop(&mut self) {
        let state = self.descriptor.state;
        if !matches!(state, LifecycleState::Created | LifecycleState::Stopped) {
            self.log.record(&FixtureEvent::Leaked {
                name: &self.descriptor.name,
                state,
            });
        }
    }
}

impl std::fmt::Debug for PostgresFixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresFixture")
            .field("descriptor", &self.descriptor)
            .field("db_host", &self.db_host)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Builder for [`PostgresFixture`].
pub struct PostgresFixtureBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    config: FixtureConfig,
    db_host: String,
    probe: Option<Arc<dyn ReadinessProbe>>,
    hooks: Arc<dyn LifecycleHooks>,
    log: Arc<dyn FixtureLog>,
    allocator: PortAllocator,
}

impl PostgresFixtureBuilder {
    fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            config: FixtureConfig::default(),
            db_host: "localhost".to_string(),
            probe: None,
            hooks: Arc::new(NoHooks),
            log: Arc::new(TracingLog),
            allocator: PortAllocator::default(),
        }
    }

    pub fn config(mut self, config: FixtureConfig) -> Self {
        self.config = config;
        self
    }

    /// Host the database is reached on. Defaults to `localhost`.
    pub fn db_host(mut self, host: impl Into<String>) -> Self {
        self.db_host = host.into();
        self
    }

    /// Readiness probe. Defaults to [`PostgresProbe`] with the configured
    /// connect timeout.
    pub fn probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Event sink. Defaults to [`TracingLog`].
    pub fn log(mut self, log: Arc<dyn FixtureLog>) -> Self {
        self.log = log;
        self
    }

    pub fn allocator(mut self, allocator: PortAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn build(self) -> Result<PostgresFixture> {
        self.config.validate()?;

        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(PostgresProbe::new(self.config.connect_timeout)));
        let image = ImageRef::new(self.config.image.clone(), self.config.tag.clone());
        let descriptor = InstanceDescriptor::new(&self.config.name_prefix, image);

        Ok(PostgresFixture {
            config: self.config,
            db_host: self.db_host,
            runtime: self.runtime,
            probe,
            hooks: self.hooks,
            log: self.log,
            allocator: self.allocator,
            descriptor,
            lease: None,
        })
    }
}
