//! `pg-fixture` command line.
//!
//! Settings are layered: defaults, then the `--config` TOML file, then
//! `PG_FIXTURE_*` environment variables, then flags.

use std::path::PathBuf;

use clap::{ColorChoice, Parser};

use crate::config::FixtureConfig;
use crate::config::helpers::optional_env;
use crate::error::ConfigError;

#[derive(Parser, Debug)]
#[command(name = "pg-fixture")]
#[command(about = "Run a throwaway PostgreSQL container until Ctrl-C")]
#[command(
    long_about = "Starts a PostgreSQL container on a free local port, waits until it answers queries, prints its connection URL and removes it again on Ctrl-C.\nExamples:\n  pg-fixture --tag 16-alpine\n  pg-fixture --port 0 --timeout-secs 60"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    /// Image tag to run
    #[arg(long)]
    pub tag: Option<String>,

    /// Image repository
    #[arg(long)]
    pub image: Option<String>,

    /// Preferred host port; 0 takes any free port
    #[arg(long)]
    pub port: Option<u16>,

    /// Seconds to wait for the database to answer queries
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// TOML settings file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}

impl Cli {
    /// Resolve the fixture settings for this invocation.
    pub fn fixture_config(&self) -> Result<FixtureConfig, ConfigError> {
        let base = match &self.config {
            Some(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidValue {
                        key: path.display().to_string(),
                        message: e.to_string(),
                    })?;
                FixtureConfig::from_toml_str(&content)?
            }
            None => FixtureConfig::default(),
        };

        let mut config = base.overlay_env(optional_env)?;
        self.apply_flags(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply_flags(&self, config: &mut FixtureConfig) {
        if let Some(tag) = &self.tag {
            config.tag = tag.clone();
        }
        if let Some(image) = &self.image {
            config.image = image.clone();
        }
        if let Some(port) = self.port {
            config.preferred_port = (port != 0).then_some(port);
        }
        if let Some(secs) = self.timeout_secs {
            config.readiness_timeout = std::time::Duration::from_secs(secs);
        }
    }
}
