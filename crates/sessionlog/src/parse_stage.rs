// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Checkpointed tailing of the binary record stream.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::errors::ParseStageError;
use crate::record::{LogEntry, RECORD_LENGTH};
use crate::staging::{Artifact, StagingStore};

const RECORD_LENGTH_U64: u64 = RECORD_LENGTH as u64;

/// Result of one parse attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A new decoded batch was staged and the checkpoint advanced to `checkpoint`.
    Parsed { records: usize, checkpoint: u64 },
    /// A decoded batch from an earlier run is still waiting for pairing.
    AlreadyStaged,
    /// Fewer than one full record is available past the checkpoint.
    NoNewData,
}

impl ParseOutcome {
    pub fn did_work(&self) -> bool {
        matches!(self, ParseOutcome::Parsed { .. })
    }
}

pub struct ParseStage {
    record_file: PathBuf,
    batch_size: usize,
    store: StagingStore,
}

impl ParseStage {
    pub fn new(record_file: impl Into<PathBuf>, batch_size: usize, store: StagingStore) -> Self {
        ParseStage {
            record_file: record_file.into(),
            batch_size,
            store,
        }
    }

    pub fn record_file(&self) -> &Path {
        &self.record_file
    }

    /// Decodes up to `batch_size` records past the checkpoint and stages them.
    ///
    /// The decoded batch is persisted before the checkpoint, so a crash in between replays
    /// the batch instead of skipping it. Nothing is persisted when reading fails.
    pub async fn try_parse_next(&self) -> Result<ParseOutcome, ParseStageError> {
        if self.store.exists(Artifact::DecodedBatch).await? {
            debug!("Decoded batch still pending, skipping parse");
            return Ok(ParseOutcome::AlreadyStaged);
        }

        let mut file = match tokio::fs::File::open(&self.record_file).await {
            Ok(file) => file,
            Err(source) => {
                return Err(ParseStageError::SourceUnavailable {
                    path: self.record_file.clone(),
                    source,
                })
            }
        };
        let stream_len = file
            .metadata()
            .await
            .map_err(|source| self.read_error(source))?
            .len();

        let checkpoint = self.store.read_checkpoint().await?;
        if checkpoint > stream_len {
            warn!(
                "Checkpoint {} is past the end of {} ({} bytes); was the file truncated?",
                checkpoint,
                self.record_file.display(),
                stream_len
            );
            return Ok(ParseOutcome::NoNewData);
        }
        if stream_len - checkpoint < RECORD_LENGTH_U64 {
            return Ok(ParseOutcome::NoNewData);
        }

        file.seek(SeekFrom::Start(checkpoint))
            .await
            .map_err(|source| self.read_error(source))?;

        let mut entries = Vec::with_capacity(self.batch_size);
        let mut position = checkpoint;
        let mut block = [0u8; RECORD_LENGTH];
        while entries.len() < self.batch_size && stream_len - position >= RECORD_LENGTH_U64 {
            match file.read_exact(&mut block).await {
                Ok(_) => {}
                // The file shrank under us; stop at the last complete record.
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(source) => return Err(self.read_error(source)),
            }
            let entry = LogEntry::decode(&block).map_err(|source| ParseStageError::Decode {
                offset: position,
                source,
            })?;
            entries.push(entry);
            position += RECORD_LENGTH_U64;
        }

        if entries.is_empty() {
            return Ok(ParseOutcome::NoNewData);
        }

        self.store
            .write_entries(Artifact::DecodedBatch, &entries)
            .await?;
        if let Err(e) = self.store.write_checkpoint(position).await {
            // Without the checkpoint the same records would be staged again next run.
            if let Err(cleanup) = self.store.remove(Artifact::DecodedBatch).await {
                warn!("Failed to discard decoded batch after checkpoint failure: {cleanup}");
            }
            return Err(e.into());
        }

        debug!(
            "Parsed {} records from {}, checkpoint now {}",
            entries.len(),
            self.record_file.display(),
            position
        );
        Ok(ParseOutcome::Parsed {
            records: entries.len(),
            checkpoint: position,
        })
    }

    fn read_error(&self, source: std::io::Error) -> ParseStageError {
        ParseStageError::Read {
            path: self.record_file.clone(),
            source,
        }
    }
}
