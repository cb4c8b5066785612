//! Container runtime abstraction.
//!
//! [`ContainerRuntime`] is the seam between the lifecycle state machine and
//! the container control plane. [`DockerRuntime`] talks to a Docker daemon
//! through bollard; tests use [`crate::testing::StubRuntime`].

mod docker;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

pub use docker::DockerRuntime;

/// Label set on every fixture container so stray ones can be found later.
pub const FIXTURE_LABEL: &str = "dockerized-postgres.fixture";

/// An image repository plus tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// One progress message from an image pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullProgress {
    /// Layer id, when the message concerns a single layer.
    pub id: Option<String>,
    /// Status text, e.g. "Downloading" or "Pull complete".
    pub status: String,
    /// Progress bar text.
    pub progress: Option<String>,
}

impl std::fmt::Display for PullProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(id) = &self.id {
            write!(f, "{}: ", id)?;
        }
        write!(f, "{}", self.status)?;
        if let Some(progress) = &self.progress {
            write!(f, " {}", progress)?;
        }
        Ok(())
    }
}

/// Everything needed to create the database container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image to run.
    pub image: ImageRef,
    /// Port the database listens on inside the container.
    pub container_port: u16,
    /// Host interface to publish on.
    pub host_ip: String,
    /// Host port to publish on.
    pub host_port: u16,
    /// Environment variables: (name, value).
    pub env: Vec<(String, String)>,
    /// Container labels: (key, value).
    pub labels: Vec<(String, String)>,
}

/// A created container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    /// Warnings the runtime returned alongside the create.
    pub warnings: Vec<String>,
}

/// Operations the lifecycle needs from a container control plane.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start pulling `image`.
    ///
    /// The stream is lazy and finite: it ends when the pull completes and
    /// yields an `Err` if the pull fails. It cannot be restarted.
    fn pull_image(&self, image: &ImageRef) -> BoxStream<'_, Result<PullProgress>>;

    /// Whether `image` is already present locally.
    async fn image_exists(&self, image: &ImageRef) -> bool;

    /// Create (but do not start) a container.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// Start a created container.
    async fn start_container(&self, handle: &ContainerHandle) -> Result<()>;

    /// Stop a running container.
    async fn stop_container(&self, handle: &ContainerHandle) -> Result<()>;

    /// Remove a container and its anonymous volumes.
    async fn remove_container(&self, handle: &ContainerHandle) -> Result<()>;

    /// Last `tail` lines of container output.
    async fn container_logs(&self, handle: &ContainerHandle, tail: usize) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_ref_display() {
        assert_eq!(ImageRef::new("postgres", "16").to_string(), "postgres:16");
    }

    #[test]
    fn test_pull_progress_display() {
        let layer = PullProgress {
            id: Some("a1b2c3".to_string()),
            status: "Downloading".to_string(),
            progress: Some("[==>   ] 1MB/4MB".to_string()),
        };
        assert_eq!(layer.to_string(), "a1b2c3: Downloading [==>   ] 1MB/4MB");

        let summary = PullProgress {
            status: "Status: Downloaded newer image for postgres:16".to_string(),
            ..Default::default()
        };
        assert_eq!(
            summary.to_string(),
            "Status: Downloaded newer image for postgres:16"
        );
    }
}
