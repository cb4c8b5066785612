//! Configuration for the fixture and the container runtime endpoint.
//!
//! Both are resolved once, up front, and validated eagerly so a malformed
//! `DOCKER_HOST` or setting fails before any container is touched.

mod fixture;
pub(crate) mod helpers;
mod runtime;

pub use fixture::{
    ALL_INTERFACES_IP, Credentials, DEFAULT_IDENTIFIER, FixtureConfig, LOOPBACK_IP, POSTGRES_PORT,
    PullPolicy,
};
pub use runtime::{DEFAULT_DOCKER_SOCKET, RuntimeEndpoint, TlsMaterial};
