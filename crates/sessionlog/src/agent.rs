// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The agent's parse -> pair -> send loop.
//!
//! The loop is strictly sequential. All state between stages lives in the staging directory,
//! so a restarted agent picks up at whichever artifact it finds. A failing stage is logged
//! and retried on the next cycle; it never stops the loop or the stages after it.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::errors::{PairingError, ParseStageError, TransmitError};
use crate::pairing::{PairOutcome, PairingStage};
use crate::parse_stage::{ParseOutcome, ParseStage};
use crate::staging::StagingStore;
use crate::transmitter::{SendOutcome, Transmitter, TransmitterConfig};

/// What each stage did during one cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub parse: Result<ParseOutcome, ParseStageError>,
    pub pair: Result<PairOutcome, PairingError>,
    pub send: Result<SendOutcome, TransmitError>,
}

impl CycleReport {
    /// Whether any stage moved data forward.
    pub fn made_progress(&self) -> bool {
        matches!(&self.parse, Ok(outcome) if outcome.did_work())
            || matches!(&self.pair, Ok(outcome) if outcome.did_work())
            || matches!(&self.send, Ok(outcome) if outcome.delivered())
    }
}

pub struct Agent {
    parse_stage: ParseStage,
    pairing_stage: PairingStage,
    transmitter: Transmitter,
    idle_interval: std::time::Duration,
}

impl Agent {
    pub fn new(config: &AgentConfig) -> Self {
        let store = StagingStore::new(&config.staging_dir);
        Agent {
            parse_stage: ParseStage::new(&config.record_file, config.batch_size, store.clone()),
            pairing_stage: PairingStage::new(store.clone()),
            transmitter: Transmitter::new(
                TransmitterConfig {
                    collector_addr: config.collector_addr.clone(),
                    connect_timeout: config.connect_timeout,
                    response_timeout: config.response_timeout,
                },
                store,
            ),
            idle_interval: config.idle_interval,
        }
    }

    /// Runs parse, pair and send once, in that order.
    pub async fn run_cycle(&self) -> CycleReport {
        let parse = self.parse_stage.try_parse_next().await;
        match &parse {
            Ok(ParseOutcome::Parsed {
                records,
                checkpoint,
            }) => debug!("Parsed {records} records, checkpoint at {checkpoint}"),
            Ok(_) => {}
            // Expected until the stream exists; `spin` warns once.
            Err(e @ ParseStageError::SourceUnavailable { .. }) => debug!("{e}"),
            Err(e) => error!("Parse stage failed: {e}"),
        }

        let pair = self.pairing_stage.try_pair().await;
        match &pair {
            Ok(PairOutcome::Paired(summary)) => debug!(
                "Paired {} sessions, {} logins pending",
                summary.matched, summary.pending
            ),
            Ok(_) => {}
            Err(e) => error!("Pairing stage failed: {e}"),
        }

        let send = self.transmitter.try_send().await;
        match &send {
            Ok(SendOutcome::Delivered { records }) => info!("Delivered {records} sessions"),
            Ok(SendOutcome::Rejected { response }) => {
                warn!("Collector rejected batch with '{response}', will retry")
            }
            Ok(SendOutcome::NothingToSend) => {}
            Err(e) => warn!("Failed to send matched batch, will retry: {e}"),
        }

        CycleReport { parse, pair, send }
    }

    /// Cycles until cancelled, pausing for the idle interval whenever a cycle made no
    /// progress.
    pub async fn spin(self, cancel_token: CancellationToken) {
        info!(
            "Agent tailing {}",
            self.parse_stage.record_file().display()
        );
        let mut source_missing_logged = false;
        while !cancel_token.is_cancelled() {
            let report = self.run_cycle().await;

            if let Err(ParseStageError::SourceUnavailable { path, .. }) = &report.parse {
                if !source_missing_logged {
                    warn!("Record stream {} is unavailable, waiting", path.display());
                    source_missing_logged = true;
                }
            } else {
                source_missing_logged = false;
            }

            if !report.made_progress() {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(self.idle_interval) => {}
                }
            }
        }
        debug!("Agent stopped");
    }
}
