//! Caller-supplied lifecycle hooks.

use std::future::Future;

use async_trait::async_trait;

use crate::connection::ConnectionInfo;

/// Code run once the database is ready and once before it is torn down.
///
/// Failures (and panics) are logged by the fixture and never abort
/// `start()` or `shutdown()`.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// Called after the first successful liveness query, e.g. to create a
    /// schema.
    async fn before(&self, _conn: &ConnectionInfo) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called at the start of `shutdown()`, e.g. to close pools.
    async fn after(&self, _conn: &ConnectionInfo) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl LifecycleHooks for NoHooks {}

/// Hooks built from two async closures.
///
/// ```rust,no_run
/// use dockerized_postgres::fixture::FnHooks;
///
/// let hooks = FnHooks::new(
///     |conn| async move {
///         println!("database ready at {}", conn);
///         Ok(())
///     },
///     |_conn| async { Ok(()) },
/// );
/// # let _ = hooks;
/// ```
pub struct FnHooks<B, A> {
    before: B,
    after: A,
}

impl<B, BF, A, AF> FnHooks<B, A>
where
    B: Fn(ConnectionInfo) -> BF,
    BF: Future<Output = anyhow::Result<()>>,
    A: Fn(ConnectionInfo) -> AF,
    AF: Future<Output = anyhow::Result<()>>,
{
    pub fn new(before: B, after: A) -> Self {
        Self { before, after }
    }
}

#[async_trait]
impl<B, BF, A, AF> LifecycleHooks for FnHooks<B, A>
where
    B: Fn(ConnectionInfo) -> BF + Send + Sync,
    BF: Future<Output = anyhow::Result<()>> + Send + 'static,
    A: Fn(ConnectionInfo) -> AF + Send + Sync,
    AF: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn before(&self, conn: &ConnectionInfo) -> anyhow::Result<()> {
        (self.before)(conn.clone()).await
    }

    async fn after(&self, conn: &ConnectionInfo) -> anyhow::Result<()> {
        (self.after)(conn.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU16, Ordering};

    use crate::config::Credentials;

    #[tokio::test]
    async fn test_fn_hooks_receive_connection_info() {
        let seen = Arc::new(AtomicU16::new(0));
        let seen_before = seen.clone();

        let hooks = FnHooks::new(
            move |conn: ConnectionInfo| {
                let seen = seen_before.clone();
                async move {
                    seen.store(conn.port, Ordering::SeqCst);
                    Ok(())
                }
            },
            |_conn: ConnectionInfo| async { anyhow::bail!("pool already closed") },
        );

        let conn = ConnectionInfo::new("localhost", 15432, &Credentials::default());
        hooks.before(&conn).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 15432);

        let err = hooks.after(&conn).await.unwrap_err();
        assert_eq!(err.to_string(), "pool already closed");
    }

    #[tokio::test]
    async fn test_no_hooks_succeed() {
        let conn = ConnectionInfo::new("localhost", 5432, &Credentials::default());
        assert!(NoHooks.before(&conn).await.is_ok());
        assert!(NoHooks.after(&conn).await.is_ok());
    }
}
