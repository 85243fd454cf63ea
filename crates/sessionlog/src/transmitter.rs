// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::constants::{ACK_OK, SENTINEL};
use crate::errors::TransmitError;
use crate::record::MatchedRecord;
use crate::staging::{Artifact, StagingStore};

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The collector acknowledged the batch and the matched batch was retired.
    Delivered { records: usize },
    /// The collector answered with something other than `OK`; the batch is kept.
    Rejected { response: String },
    /// No matched batch is waiting.
    NothingToSend,
}

impl SendOutcome {
    pub fn delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered { .. })
    }
}

pub struct TransmitterConfig {
    pub collector_addr: String,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

pub struct Transmitter {
    store: StagingStore,
    collector_addr: String,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl Transmitter {
    pub fn new(config: TransmitterConfig, store: StagingStore) -> Self {
        Transmitter {
            store,
            collector_addr: config.collector_addr,
            connect_timeout: config.connect_timeout,
            response_timeout: config.response_timeout,
        }
    }

    /// Sends the matched batch and retires it once the collector answers `OK`.
    ///
    /// Anything short of that leaves the batch in place for the next cycle. The connection
    /// is dropped, and so closed, on every path out of this function.
    pub async fn try_send(&self) -> Result<SendOutcome, TransmitError> {
        let Some(records) = self.store.read_matched().await? else {
            return Ok(SendOutcome::NothingToSend);
        };

        let response = self.exchange(&records).await?;
        if response != ACK_OK {
            warn!(
                "Collector at {} rejected {} records: '{}'",
                self.collector_addr,
                records.len(),
                response
            );
            return Ok(SendOutcome::Rejected { response });
        }

        self.store.remove(Artifact::MatchedBatch).await?;
        debug!(
            "Delivered {} matched records to {}",
            records.len(),
            self.collector_addr
        );
        Ok(SendOutcome::Delivered {
            records: records.len(),
        })
    }

    async fn exchange(&self, records: &[MatchedRecord]) -> Result<String, TransmitError> {
        let mut stream = match timeout(
            self.connect_timeout,
            TcpStream::connect(&self.collector_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransmitError::Connect {
                    addr: self.collector_addr.clone(),
                    source,
                })
            }
            Err(_) => return Err(TransmitError::Timeout(self.connect_timeout, "connecting")),
        };

        let payload = render_batch(records);
        let (read_half, mut write_half) = stream.split();

        let send = async {
            write_half.write_all(payload.as_bytes()).await?;
            write_half.flush().await
        };
        timeout(self.response_timeout, send)
            .await
            .map_err(|_| TransmitError::Timeout(self.response_timeout, "sending batch"))??;

        let mut response = String::new();
        let mut reader = BufReader::new(read_half);
        let read = timeout(self.response_timeout, reader.read_line(&mut response))
            .await
            .map_err(|_| {
                TransmitError::Timeout(self.response_timeout, "waiting for acknowledgement")
            })??;
        if read == 0 {
            return Err(TransmitError::NoAcknowledgement);
        }

        Ok(response.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// One line per log entry followed by the sentinel.
fn render_batch(records: &[MatchedRecord]) -> String {
    let mut payload = String::new();
    for line in records.iter().flat_map(MatchedRecord::lines) {
        payload.push_str(&line);
        payload.push('\n');
    }
    payload.push_str(SENTINEL);
    payload.push('\n');
    payload
}
