//! Container runtime endpoint selection.
//!
//! Mirrors the Docker CLI conventions:
//!
//! - `DOCKER_HOST` unset: local socket at `/var/run/docker.sock`
//! - `DOCKER_HOST=unix:///path/to/docker.sock`: local socket at that path
//! - `DOCKER_HOST=tcp://host:port` (scheme optional): remote daemon
//! - `DOCKER_USE_HTTPS` set: remote daemon over TLS, with `ca.pem`,
//!   `cert.pem` and `key.pem` read from `DOCKER_CERT_PATH`

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::config::helpers::{is_truthy, optional_env};
use crate::config::{ALL_INTERFACES_IP, LOOPBACK_IP};
use crate::error::ConfigError;

/// Socket used when `DOCKER_HOST` is not set.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

static REMOTE_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:tcp|http|https)://)?([^:/\s]+):([0-9]+)/?$")
        .expect("DOCKER_HOST pattern is valid")
});

/// Where the container runtime's control plane lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEndpoint {
    /// Unix domain socket on this machine.
    LocalSocket {
        /// Path to the socket.
        path: PathBuf,
    },
    /// Daemon reachable over TCP.
    Remote {
        /// Host name or address.
        host: String,
        /// TCP port.
        port: u16,
        /// Client TLS material; `None` for plain HTTP.
        tls: Option<TlsMaterial>,
    },
}

/// Client certificate bundle for a TLS-protected daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsMaterial {
    /// Locate `ca.pem`, `cert.pem` and `key.pem` inside `dir`.
    ///
    /// Every file must exist so a bad cert path fails here rather than on
    /// the first Docker call.
    pub fn from_cert_dir(dir: &Path) -> Result<Self, ConfigError> {
        let material = Self {
            ca: dir.join("ca.pem"),
            cert: dir.join("cert.pem"),
            key: dir.join("key.pem"),
        };

        for file in [&material.ca, &material.cert, &material.key] {
            if !file.is_file() {
                return Err(ConfigError::InvalidValue {
                    key: "DOCKER_CERT_PATH".to_string(),
                    message: format!("unable to read docker certificate {}", file.display()),
                });
            }
        }

        Ok(material)
    }
}

impl Default for RuntimeEndpoint {
    fn default() -> Self {
        RuntimeEndpoint::LocalSocket {
            path: PathBuf::from(DEFAULT_DOCKER_SOCKET),
        }
    }
}

impl RuntimeEndpoint {
    /// Resolve the endpoint from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::resolve_with(optional_env)
    }

    /// Resolve the endpoint using `lookup` for variable access.
    pub fn resolve_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<Option<String>, ConfigError>,
    {
        let Some(docker_host) = lookup("DOCKER_HOST")? else {
            return Ok(Self::default());
        };

        if let Some(path) = docker_host.strip_prefix("unix://") {
            let path = if path.is_empty() {
                DEFAULT_DOCKER_SOCKET
            } else {
                path
            };
            return Ok(RuntimeEndpoint::LocalSocket {
                path: PathBuf::from(path),
            });
        }

        let (host, port) = parse_remote_host(&docker_host)?;

        let use_https = lookup("DOCKER_USE_HTTPS")?.is_some_and(|v| is_truthy(&v));
        let tls = if use_https {
            let cert_dir = lookup("DOCKER_CERT_PATH")?.ok_or_else(|| {
                ConfigError::MissingRequired {
                    key: "DOCKER_CERT_PATH".to_string(),
                    hint: "DOCKER_CERT_PATH is required when DOCKER_USE_HTTPS is set".to_string(),
                }
            })?;
            Some(TlsMaterial::from_cert_dir(Path::new(&cert_dir))?)
        } else {
            None
        };

        Ok(RuntimeEndpoint::Remote { host, port, tls })
    }

    /// Host the database is reachable on once its port is published.
    pub fn database_host(&self) -> &str {
        match self {
            RuntimeEndpoint::LocalSocket { .. } => "localhost",
            RuntimeEndpoint::Remote { host, .. } => host,
        }
    }

    /// Host interface to publish container ports on so that
    /// [`database_host`](Self::database_host) can reach them.
    pub fn publish_ip(&self) -> &'static str {
        match self {
            RuntimeEndpoint::LocalSocket { .. } => LOOPBACK_IP,
            RuntimeEndpoint::Remote { .. } => ALL_INTERFACES_IP,
        }
    }

    /// Transport protocol used to talk to the daemon.
    pub fn protocol(&self) -> &'static str {
        match self {
            RuntimeEndpoint::LocalSocket { .. } => "unix",
            RuntimeEndpoint::Remote { tls: None, .. } => "http",
            RuntimeEndpoint::Remote { tls: Some(_), .. } => "https",
        }
    }
}

impl std::fmt::Display for RuntimeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeEndpoint::LocalSocket { path } => write!(f, "unix://{}", path.display()),
            RuntimeEndpoint::Remote { host, port, .. } => {
                write!(f, "{}://{}:{}", self.protocol(), host, port)
            }
        }
    }
}

fn parse_remote_host(value: &str) -> Result<(String, u16), ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "DOCKER_HOST".to_string(),
        message,
    };

    let caps = REMOTE_HOST.captures(value.trim()).ok_or_else(|| {
        invalid(format!(
            "'{value}' should look like tcp://localhost:2375 or unix:///var/run/docker.sock"
        ))
    })?;

    let port = caps[2]
        .parse::<u16>()
        .map_err(|e| invalid(format!("port '{}': {e}", &caps[2])))?;

    Ok((caps[1].to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::lookup_from;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_to_local_socket() {
        let endpoint = RuntimeEndpoint::resolve_with(lookup_from(&[])).unwrap();
        assert_eq!(endpoint, RuntimeEndpoint::default());
        assert_eq!(endpoint.to_string(), "unix:///var/run/docker.sock");
        assert_eq!(endpoint.database_host(), "localhost");
        assert_eq!(endpoint.publish_ip(), "127.0.0.1");
    }

    #[test]
    fn test_unix_scheme() {
        let endpoint =
            RuntimeEndpoint::resolve_with(lookup_from(&[("DOCKER_HOST", "unix:///run/user/1000/docker.sock")]))
                .unwrap();
        assert_eq!(
            endpoint,
            RuntimeEndpoint::LocalSocket {
                path: PathBuf::from("/run/user/1000/docker.sock")
            }
        );

        let endpoint =
            RuntimeEndpoint::resolve_with(lookup_from(&[("DOCKER_HOST", "unix://")])).unwrap();
        assert_eq!(endpoint, RuntimeEndpoint::default());
    }

    #[test]
    fn test_remote_with_and_without_scheme() {
        for value in ["tcp://docker.internal:2375", "docker.internal:2375"] {
            let endpoint =
                RuntimeEndpoint::resolve_with(lookup_from(&[("DOCKER_HOST", value)])).unwrap();
            assert_eq!(
                endpoint,
                RuntimeEndpoint::Remote {
                    host: "docker.internal".to_string(),
                    port: 2375,
                    tls: None,
                }
            );
            assert_eq!(endpoint.database_host(), "docker.internal");
            assert_eq!(endpoint.publish_ip(), "0.0.0.0");
            assert_eq!(endpoint.protocol(), "http");
        }
    }

    #[test]
    fn test_malformed_host_fails_fast() {
        for value in ["tcp://docker.internal", "ssh://user@box", "host:99999", "just-a-name"] {
            let err = RuntimeEndpoint::resolve_with(lookup_from(&[("DOCKER_HOST", value)]))
                .unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "DOCKER_HOST"),
                "{value} should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn test_https_requires_cert_path() {
        let err = RuntimeEndpoint::resolve_with(lookup_from(&[
            ("DOCKER_HOST", "tcp://docker.internal:2376"),
            ("DOCKER_USE_HTTPS", "1"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "DOCKER_CERT_PATH"));
    }

    #[test]
    fn test_https_reads_cert_dir() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ca.pem", "cert.pem", "key.pem"] {
            std::fs::write(dir.path().join(name), "-----BEGIN-----").unwrap();
        }
        let cert_path = dir.path().to_string_lossy().to_string();

        let endpoint = RuntimeEndpoint::resolve_with(lookup_from(&[
            ("DOCKER_HOST", "tcp://docker.internal:2376"),
            ("DOCKER_USE_HTTPS", "true"),
            ("DOCKER_CERT_PATH", &cert_path),
        ]))
        .unwrap();

        assert_eq!(endpoint.protocol(), "https");
        assert_eq!(endpoint.to_string(), "https://docker.internal:2376");
        match endpoint {
            RuntimeEndpoint::Remote { tls: Some(tls), .. } => {
                assert_eq!(tls.key, dir.path().join("key.pem"));
            }
            other => panic!("expected TLS endpoint, got {other:?}"),
        }
    }

    #[test]
    fn test_https_missing_key_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ca.pem"), "x").unwrap();
        std::fs::write(dir.path().join("cert.pem"), "x").unwrap();

        let err = TlsMaterial::from_cert_dir(dir.path()).unwrap_err();
        match err {
            ConfigError::InvalidValue { message, .. } => assert!(message.contains("key.pem")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_https_flag_ignored_for_unix_socket() {
        let endpoint = RuntimeEndpoint::resolve_with(lookup_from(&[
            ("DOCKER_HOST", "unix:///var/run/docker.sock"),
            ("DOCKER_USE_HTTPS", "1"),
        ]))
        .unwrap();
        assert_eq!(endpoint.protocol(), "unix");
    }
}
