//! Database readiness probing.
//!
//! A TCP accept is not enough: the postgres image restarts the server once
//! after running its init scripts, so the fixture waits until a fresh
//! connection can run `SELECT 1`.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tokio_postgres::NoTls;

use crate::connection::ConnectionInfo;
use crate::error::{ConfigError, FixtureError, Result};
use crate::log::{FixtureEvent, FixtureLog};

/// How long a closed client's connection task may take to wind down.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Why a single probe did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("liveness query failed: {0}")]
    Query(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
}

/// Outcome of one probe, reported through the fixture log.
#[derive(Debug, Clone)]
pub struct ProbeAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Time since the readiness wait began.
    pub elapsed: Duration,
    pub outcome: std::result::Result<(), ProbeError>,
    /// Whether another attempt follows a failure.
    pub will_retry: bool,
}

/// Summary of a successful readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyWait {
    /// Probes made, including the successful one.
    pub attempts: u32,
    /// Accumulated wait budget consumed.
    pub waited: Duration,
}

/// A single liveness check against the database.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Succeed only if the database accepted a connection and answered a
    /// trivial query. Any connection opened must be closed before returning.
    async fn probe(&self, target: &ConnectionInfo) -> std::result::Result<(), ProbeError>;
}

/// Probe that connects with tokio-postgres and runs `SELECT 1`.
#[derive(Debug, Clone)]
pub struct PostgresProbe {
    connect_timeout: Duration,
}

impl PostgresProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for PostgresProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl ReadinessProbe for PostgresProbe {
    async fn probe(&self, target: &ConnectionInfo) -> std::result::Result<(), ProbeError> {
        let mut config = target.pg_config();
        config.connect_timeout(self.connect_timeout);

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| ProbeError::Connect(e.to_string()))?;
        let mut connection = tokio::spawn(connection);

        let result =
            match tokio::time::timeout(self.connect_timeout, client.query_one("SELECT 1", &[]))
                .await
            {
                Ok(Ok(row)) => match row.try_get::<_, i32>(0) {
                    Ok(1) => Ok(()),
                    Ok(other) => Err(ProbeError::Query(format!("SELECT 1 returned {}", other))),
                    Err(e) => Err(ProbeError::Query(e.to_string())),
                },
                Ok(Err(e)) => Err(ProbeError::Query(e.to_string())),
                Err(_) => Err(ProbeError::Timeout(self.connect_timeout)),
            };

        // Dropping the client ends the connection task; abort it if the
        // server does not close in time.
        drop(client);
        if tokio::time::timeout(CLOSE_GRACE, &mut connection)
            .await
            .is_err()
        {
            connection.abort();
        }

        result
    }
}

/// Probe until the database is live or the wait budget is spent.
///
/// Each attempt charges `interval` against `timeout` before it runs, so an
/// always-failing probe is tried `ceil(timeout / interval)` times. Failed
/// attempts are followed by a fixed `interval` sleep unless the budget is
/// already exhausted. A zero `interval` is rejected before any attempt.
pub async fn wait_ready(
    probe: &dyn ReadinessProbe,
    target: &ConnectionInfo,
    timeout: Duration,
    interval: Duration,
    log: &dyn FixtureLog,
) -> Result<ReadyWait> {
    if interval.is_zero() {
        return Err(ConfigError::InvalidValue {
            key: "probe_interval".to_string(),
            message: "must be greater than zero".to_string(),
        }
        .into());
    }

    let started = Instant::now();
    let mut waited = Duration::ZERO;
    let mut attempts = 0u32;
    let mut last_error = None;

    while waited < timeout {
        waited += interval;
        attempts += 1;

        let outcome = probe.probe(target).await;
        let attempt = ProbeAttempt {
            attempt: attempts,
            elapsed: started.elapsed(),
            will_retry: outcome.is_err() && waited < timeout,
            outcome,
        };
        log.record(&FixtureEvent::ProbeAttempt(&attempt));

        match attempt.outcome {
            Ok(()) => return Ok(ReadyWait { attempts, waited }),
            Err(e) => {
                last_error = Some(e);
                if attempt.will_retry {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    Err(FixtureError::ReadinessTimeout {
        port: target.port,
        timeout,
        attempts,
        last_error: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no probe attempted".to_string()),
    })
}
