// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use sessionlog::{agent::Agent, config::AgentConfig};

#[tokio::main]
pub async fn main() {
    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error creating agent config: {e}");
            return;
        }
    };

    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("{e:#}");
        return;
    }

    if let Err(e) = run(config).await {
        error!("Agent failed: {e:#}");
    }
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).context("could not parse log level in configuration")?,
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    debug!("Logging subsystem enabled");
    Ok(())
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    info!(
        "agent: staging in {}, forwarding to {} in batches of {}",
        config.staging_dir.display(),
        config.collector_addr,
        config.batch_size
    );

    let cancel_token = CancellationToken::new();
    let agent_task = tokio::spawn(Agent::new(&config).spin(cancel_token.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down agent");

    // The current cycle finishes; every stage is resumable from its artifacts anyway.
    cancel_token.cancel();
    agent_task.await.context("agent task failed")?;
    Ok(())
}
