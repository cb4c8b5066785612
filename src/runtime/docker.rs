//! Docker implementation of [`ContainerRuntime`] using bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};

use crate::config::RuntimeEndpoint;
use crate::error::{FixtureError, Result};
use crate::fixture::Step;
use crate::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec, ImageRef, PullProgress};

/// Request timeout for daemon calls, in seconds.
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Grace period given to postgres before the daemon kills it.
const STOP_GRACE_SECS: i64 = 10;

/// Container runtime backed by a Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
    endpoint: RuntimeEndpoint,
}

impl DockerRuntime {
    /// Build a client for `endpoint`.
    ///
    /// bollard connects lazily, so this only fails for unusable endpoint
    /// material such as a missing socket file or unreadable TLS files.
    /// Daemon reachability is checked by [`ping`](Self::ping) or the first
    /// lifecycle call.
    pub fn connect(endpoint: &RuntimeEndpoint) -> Result<Self> {
        let docker = match endpoint {
            #[cfg(unix)]
            RuntimeEndpoint::LocalSocket { path } => Docker::connect_with_unix(
                &path.to_string_lossy(),
                DOCKER_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
            #[cfg(not(unix))]
            RuntimeEndpoint::LocalSocket { .. } => Docker::connect_with_local_defaults(),
            RuntimeEndpoint::Remote {
                host,
                port,
                tls: None,
            } => Docker::connect_with_http(
                &format!("tcp://{}:{}", host, port),
                DOCKER_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
            RuntimeEndpoint::Remote {
                host,
                port,
                tls: Some(tls),
            } => Docker::connect_with_ssl(
                &format!("tcp://{}:{}", host, port),
                &tls.key,
                &tls.cert,
                &tls.ca,
                DOCKER_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
        }
        .map_err(|e| FixtureError::DockerNotAvailable {
            reason: format!("{}: {}", endpoint, e),
        })?;

        Ok(Self {
            docker,
            endpoint: endpoint.clone(),
        })
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| FixtureError::DockerNotAvailable {
                reason: format!("{}: {}", self.endpoint, e),
            })
    }

    pub fn endpoint(&self) -> &RuntimeEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn pull_image(&self, image: &ImageRef) -> BoxStream<'_, Result<PullProgress>> {
        let reference = image.to_string();
        let options = CreateImageOptions {
            from_image: image.name.clone(),
            tag: image.tag.clone(),
            ..Default::default()
        };

        self.docker
            .create_image(Some(options), None, None)
            .map(move |item| match item {
                Ok(info) => Ok(PullProgress {
                    id: info.id,
                    status: info.status.unwrap_or_default(),
                    progress: info.progress,
                }),
                Err(e) => Err(FixtureError::Pull {
                    image: reference.clone(),
                    reason: e.to_string(),
                }),
            })
            .boxed()
    }

    async fn image_exists(&self, image: &ImageRef) -> bool {
        self.docker.inspect_image(&image.to_string()).await.is_ok()
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let container_port = format!("{}/tcp", spec.container_port);

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some(spec.host_ip.clone()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        // bollard expects HashMap<String, HashMap<(), ()>>
        let exposed_ports: HashMap<String, HashMap<(), ()>> =
            HashMap::from([(container_port, HashMap::new())]);

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let labels: HashMap<String, String> = spec.labels.iter().cloned().collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            // Removal is explicit so logs survive a failed readiness check.
            auto_remove: Some(false),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.to_string()),
            env: if env.is_empty() { None } else { Some(env) },
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| FixtureError::Create {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        Ok(ContainerHandle {
            id: response.id,
            name: spec.name.clone(),
            warnings: response.warnings,
        })
    }

    async fn start_container(&self, handle: &ContainerHandle) -> Result<()> {
        self.docker
            .start_container(&handle.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| FixtureError::Start {
                name: handle.name.clone(),
                reason: e.to_string(),
            })
    }

    async fn stop_container(&self, handle: &ContainerHandle) -> Result<()> {
        match self
            .docker
            .stop_container(&handle.id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(FixtureError::Teardown {
                step: Step::Stop,
                name: handle.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn remove_container(&self, handle: &ContainerHandle) -> Result<()> {
        self.docker
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| FixtureError::Teardown {
                step: Step::Remove,
                name: handle.name.clone(),
                reason: e.to_string(),
            })
    }

    async fn container_logs(&self, handle: &ContainerHandle, tail: usize) -> Result<Vec<String>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let chunks: Vec<String> = self
            .docker
            .logs(&handle.id, Some(options))
            .map_ok(|output| output.to_string())
            .try_collect()
            .await
            .map_err(|e| FixtureError::Logs {
                name: handle.name.clone(),
                reason: e.to_string(),
            })?;

        Ok(chunks
            .iter()
            .flat_map(|chunk| chunk.lines())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_endpoint() -> RuntimeEndpoint {
        RuntimeEndpoint::Remote {
            host: "127.0.0.1".to_string(),
            port: 1,
            tls: None,
        }
    }

    #[tokio::test]
    async fn test_connect_does_not_contact_daemon() {
        let endpoint = unreachable_endpoint();
        let runtime = DockerRuntime::connect(&endpoint).unwrap();
        assert_eq!(runtime.endpoint(), &endpoint);
    }

    #[tokio::test]
    async fn test_ping_unreachable_daemon() {
        let runtime = DockerRuntime::connect(&unreachable_endpoint()).unwrap();
        let err = runtime.ping().await.unwrap_err();
        assert!(matches!(err, FixtureError::DockerNotAvailable { .. }));
    }
}
