//! pg-fixture: run a throwaway PostgreSQL container until Ctrl-C.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use dockerized_postgres::{
    cli::Cli,
    config::RuntimeEndpoint,
    fixture::{NoHooks, PostgresFixture, TeardownReport},
    runtime::DockerRuntime,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before anything reads PG_FIXTURE_* or DOCKER_*
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dockerized_postgres=info,pg_fixture=info"));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }

    let endpoint = RuntimeEndpoint::from_env()?;
    let config = cli.fixture_config()?;

    let runtime = DockerRuntime::connect(&endpoint)?;
    runtime.ping().await?;
    tracing::info!("Docker reachable at {}", endpoint);

    let mut fixture = PostgresFixture::with_docker(runtime, config, Arc::new(NoHooks))?;

    let conn = match fixture.start().await {
        Ok(conn) => conn,
        Err(e) => {
            warn_failures(&fixture.shutdown().await);
            return Err(anyhow::Error::new(e).context("database did not start"));
        }
    };

    println!("{}", conn.url());
    tracing::info!("Database {} is up, press Ctrl-C to stop", fixture.descriptor().name);

    let interrupted = tokio::signal::ctrl_c().await;
    warn_failures(&fixture.shutdown().await);
    interrupted?;

    Ok(())
}

fn warn_failures(report: &TeardownReport) {
    for failure in &report.failures {
        eprintln!("warning: [{}] {}", failure.step, failure.message);
    }
}
