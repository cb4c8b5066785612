use std::time::Duration;

use serde::Deserialize;

use crate::config::helpers::{optional_env, parse_lookup};
use crate::error::ConfigError;

/// Standard PostgreSQL port inside the container.
pub const POSTGRES_PORT: u16 = 5432;

/// Host interface ports are published on for a local daemon.
pub const LOOPBACK_IP: &str = "127.0.0.1";

/// Host interface ports are published on for a remote daemon.
pub const ALL_INTERFACES_IP: &str = "0.0.0.0";

/// Identifier used for user, password and database name by default.
pub const DEFAULT_IDENTIFIER: &str = "postgres";

/// When to pull the image before creating the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Pull every time so a moving tag like `latest` is refreshed.
    #[default]
    Always,
    /// Pull only when the image is not present locally.
    IfMissing,
}

impl std::fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::IfMissing => write!(f, "if-missing"),
        }
    }
}

impl std::str::FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "if-missing" | "if_missing" | "missing" => Ok(Self::IfMissing),
            _ => Err(format!(
                "invalid pull policy '{}', expected 'always' or 'if-missing'",
                s
            )),
        }
    }
}

/// Database credentials baked into the container and used by the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            user: DEFAULT_IDENTIFIER.to_string(),
            password: DEFAULT_IDENTIFIER.to_string(),
            database: DEFAULT_IDENTIFIER.to_string(),
        }
    }
}

/// Settings for one fixture instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureConfig {
    /// Image repository (without tag).
    pub image: String,
    /// Image tag.
    pub tag: String,
    /// Prefix for the generated container name.
    pub name_prefix: String,
    /// Database port inside the container.
    pub container_port: u16,
    /// Host port to try first; an ephemeral port is used if it is taken.
    pub preferred_port: Option<u16>,
    /// Host interface the container port is published on. `None` follows
    /// the runtime endpoint: loopback for a local daemon, all interfaces for
    /// a remote one.
    pub host_ip: Option<String>,
    /// Credentials for the database.
    pub credentials: Credentials,
    /// Total time to wait for the database to answer `SELECT 1`.
    pub readiness_timeout: Duration,
    /// Fixed pause between readiness probes.
    pub probe_interval: Duration,
    /// Connect timeout for a single probe.
    pub connect_timeout: Duration,
    /// Ceiling for draining the image pull stream.
    pub pull_timeout: Duration,
    /// When to pull the image.
    pub pull_policy: PullPolicy,
    /// Container log lines attached to readiness failures.
    pub log_tail: usize,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            image: "postgres".to_string(),
            tag: "latest".to_string(),
            name_prefix: "postgres".to_string(),
            container_port: POSTGRES_PORT,
            preferred_port: Some(POSTGRES_PORT),
            host_ip: None,
            credentials: Credentials::default(),
            readiness_timeout: Duration::from_secs(20),
            probe_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            pull_timeout: Duration::from_secs(300),
            pull_policy: PullPolicy::Always,
            log_tail: 50,
        }
    }
}

/// On-disk form of [`FixtureConfig`]; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FixtureFile {
    image: Option<String>,
    tag: Option<String>,
    name_prefix: Option<String>,
    container_port: Option<u16>,
    port: Option<u16>,
    host_ip: Option<String>,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
    ready_timeout_secs: Option<u64>,
    probe_interval_ms: Option<u64>,
    connect_timeout_secs: Option<u64>,
    pull_timeout_secs: Option<u64>,
    pull_policy: Option<PullPolicy>,
    log_tail: Option<usize>,
}

impl FixtureConfig {
    /// Defaults overridden by `PG_FIXTURE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay_env(optional_env)
    }

    /// Parse a TOML document on top of the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: FixtureFile = toml::from_str(content).map_err(|e| ConfigError::InvalidValue {
            key: "config file".to_string(),
            message: e.to_string(),
        })?;

        let mut config = Self::default();
        if let Some(v) = file.image {
            config.image = v;
        }
        if let Some(v) = file.tag {
            config.tag = v;
        }
        if let Some(v) = file.name_prefix {
            config.name_prefix = v;
        }
        if let Some(v) = file.container_port {
            config.container_port = v;
        }
        if let Some(v) = file.port {
            config.preferred_port = Some(v);
        }
        if let Some(v) = file.host_ip {
            config.host_ip = Some(v);
        }
        if let Some(v) = file.user {
            config.credentials.user = v;
        }
        if let Some(v) = file.password {
            config.credentials.password = v;
        }
        if let Some(v) = file.database {
            config.credentials.database = v;
        }
        if let Some(v) = file.ready_timeout_secs {
            config.readiness_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.probe_interval_ms {
            config.probe_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.pull_timeout_secs {
            config.pull_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.pull_policy {
            config.pull_policy = v;
        }
        if let Some(v) = file.log_tail {
            config.log_tail = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply `PG_FIXTURE_*` overrides read through `lookup`.
    pub fn overlay_env<F>(self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<Option<String>, ConfigError>,
    {
        let preferred_port = match lookup("PG_FIXTURE_PORT")? {
            // 0 asks for any free port.
            Some(raw) if raw.trim() == "0" => None,
            Some(_) => Some(parse_lookup(&lookup, "PG_FIXTURE_PORT", POSTGRES_PORT)?),
            None => self.preferred_port,
        };

        let config = Self {
            image: lookup("PG_FIXTURE_IMAGE")?.unwrap_or(self.image),
            tag: lookup("PG_FIXTURE_TAG")?.unwrap_or(self.tag),
            preferred_port,
            readiness_timeout: Duration::from_secs(parse_lookup(
                &lookup,
                "PG_FIXTURE_READY_TIMEOUT_SECS",
                self.readiness_timeout.as_secs(),
            )?),
            probe_interval: Duration::from_millis(parse_lookup(
                &lookup,
                "PG_FIXTURE_PROBE_INTERVAL_MS",
                self.probe_interval.as_millis() as u64,
            )?),
            pull_policy: parse_lookup(&lookup, "PG_FIXTURE_PULL_POLICY", self.pull_policy)?,
            ..self
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the lifecycle misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "probe_interval".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.readiness_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "readiness_timeout".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.image.is_empty() || self.tag.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "image".to_string(),
                message: "image and tag must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// `image:tag` reference.
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::lookup_from;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_match_stock_postgres_image() {
        let config = FixtureConfig::default();
        assert_eq!(config.image_ref(), "postgres:latest");
        assert_eq!(config.preferred_port, Some(5432));
        assert_eq!(config.host_ip, None);
        assert_eq!(config.credentials.user, "postgres");
        assert_eq!(config.readiness_timeout, Duration::from_secs(20));
        assert_eq!(config.probe_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overlay() {
        let config = FixtureConfig::default()
            .overlay_env(lookup_from(&[
                ("PG_FIXTURE_TAG", "16-alpine"),
                ("PG_FIXTURE_PORT", "0"),
                ("PG_FIXTURE_READY_TIMEOUT_SECS", "45"),
                ("PG_FIXTURE_PROBE_INTERVAL_MS", "250"),
                ("PG_FIXTURE_PULL_POLICY", "if-missing"),
            ]))
            .unwrap();

        assert_eq!(config.image_ref(), "postgres:16-alpine");
        assert_eq!(config.preferred_port, None);
        assert_eq!(config.readiness_timeout, Duration::from_secs(45));
        assert_eq!(config.probe_interval, Duration::from_millis(250));
        assert_eq!(config.pull_policy, PullPolicy::IfMissing);
    }

    #[test]
    fn test_env_overlay_rejects_bad_values() {
        let err = FixtureConfig::default()
            .overlay_env(lookup_from(&[("PG_FIXTURE_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "PG_FIXTURE_PORT"));

        let err = FixtureConfig::default()
            .overlay_env(lookup_from(&[("PG_FIXTURE_PROBE_INTERVAL_MS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "probe_interval"));
    }

    #[test]
    fn test_toml_document() {
        let config = FixtureConfig::from_toml_str(
            r#"
            tag = "15"
            port = 15432
            user = "app"
            password = "secret"
            database = "app_test"
            ready_timeout_secs = 60
            pull_policy = "if-missing"
            "#,
        )
        .unwrap();

        assert_eq!(config.image_ref(), "postgres:15");
        assert_eq!(config.preferred_port, Some(15432));
        assert_eq!(
            config.credentials,
            Credentials {
                user: "app".to_string(),
                password: "secret".to_string(),
                database: "app_test".to_string(),
            }
        );
        assert_eq!(config.readiness_timeout, Duration::from_secs(60));
        assert_eq!(config.pull_policy, PullPolicy::IfMissing);
        assert_eq!(config.probe_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_toml_unknown_key_rejected() {
        let err = FixtureConfig::from_toml_str("volume = \"/data\"").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "config file"));
    }

    #[test]
    fn test_pull_policy_parse() {
        assert_eq!("ALWAYS".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert_eq!("missing".parse::<PullPolicy>().unwrap(), PullPolicy::IfMissing);
        assert!("never".parse::<PullPolicy>().is_err());
        assert_eq!(PullPolicy::IfMissing.to_string(), "if-missing");
    }
}
