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

use sessionlog::{
    collector::Collector, config::CollectorConfig, writer_service::WriterService,
};

#[tokio::main]
pub async fn main() {
    let config = match CollectorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error creating collector config: {e}");
            return;
        }
    };

    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("{e:#}");
        return;
    }

    if let Err(e) = run(config).await {
        error!("Collector failed: {e:#}");
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

async fn run(config: CollectorConfig) -> anyhow::Result<()> {
    // 1. The writer owns the output log
    let (service, writer_handle) = WriterService::new(&config.output_log).await?;
    let writer_task = tokio::spawn(service.run());

    // 2. Handlers only ever see a handle
    let cancel_token = CancellationToken::new();
    let collector = Collector::new(&config, writer_handle.clone(), cancel_token.clone()).await?;
    info!(
        "collector: listening on {}, appending to {}",
        collector.local_addr()?,
        config.output_log.display()
    );
    let collector_task = tokio::spawn(collector.spin());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down collector");

    cancel_token.cancel();
    collector_task.await.context("collector task failed")?;

    // 3. Drain what the handlers already queued before stopping the writer
    let written = writer_handle
        .flush()
        .await
        .map_err(anyhow::Error::msg)?;
    debug!("Writer flushed, {written} lines written this run");
    writer_handle.shutdown()?;
    writer_task.await.context("writer task failed")?;
    Ok(())
}
