//! Ephemeral PostgreSQL containers as test fixtures.
//!
//! A [`PostgresFixture`] reserves a host port, pulls and starts a
//! `postgres` container, waits until it answers `SELECT 1`, runs a
//! caller-supplied before hook and hands back [`ConnectionInfo`]. Calling
//! [`shutdown`](PostgresFixture::shutdown) runs the after hook and removes
//! the container again.
//!
//! ```rust,no_run
//! use dockerized_postgres::fixture::{FnHooks, PostgresFixture};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let hooks = FnHooks::new(
//!     |conn| async move {
//!         println!("ready at {}", conn);
//!         Ok(())
//!     },
//!     |_conn| async { Ok(()) },
//! );
//! let mut fixture = PostgresFixture::from_env(hooks)?;
//! let conn = fixture.start().await?;
//! // ... run tests against conn.url() ...
//! let report = fixture.shutdown().await;
//! assert!(report.is_clean());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod fixture;
pub mod log;
pub mod port;
pub mod readiness;
pub mod runtime;
pub mod testing;

pub use config::{FixtureConfig, RuntimeEndpoint};
pub use connection::ConnectionInfo;
pub use error::{ConfigError, FixtureError, Result};
pub use fixture::{FnHooks, LifecycleHooks, LifecycleState, NoHooks, PostgresFixture};
