// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! File-backed state shared by the agent's pipeline stages.
//!
//! Each stage hands its output to the next through an artifact file. An artifact that exists
//! has not been consumed yet, so the producing stage must not run again until the consumer
//! removes it. Every write goes to a temporary sibling first and is renamed into place once
//! synced, so a crash never leaves a half-written artifact behind under its real name.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::errors::StagingError;
use crate::record::{LogEntry, MatchedRecord};

const CHECKPOINT_FILE: &str = "last-position.txt";
const TMP_SUFFIX: &str = ".tmp";

/// The artifacts passed between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    /// Entries decoded by the parse stage, waiting for pairing.
    DecodedBatch,
    /// Logins that have not seen their logout yet, carried into the next pairing run.
    PendingLogins,
    /// Paired sessions waiting for transmission.
    MatchedBatch,
}

impl Artifact {
    pub fn file_name(self) -> &'static str {
        match self {
            Artifact::DecodedBatch => "log.txt",
            Artifact::PendingLogins => "login.txt",
            Artifact::MatchedBatch => "logrec.txt",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagingStore {
    dir: PathBuf,
}

impl StagingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        StagingStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, artifact: Artifact) -> PathBuf {
        self.dir.join(artifact.file_name())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    pub async fn exists(&self, artifact: Artifact) -> Result<bool, StagingError> {
        let path = self.path(artifact);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StagingError::io(path, e))
    }

    /// Loads an artifact, or `None` when it doesn't exist.
    pub async fn read_entries(
        &self,
        artifact: Artifact,
    ) -> Result<Option<Vec<LogEntry>>, StagingError> {
        let path = self.path(artifact);
        let Some(contents) = read_optional(&path).await? else {
            return Ok(None);
        };

        let mut entries = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = line
                .parse::<LogEntry>()
                .map_err(|source| StagingError::Line {
                    path: path.clone(),
                    line_no: index + 1,
                    source,
                })?;
            entries.push(entry);
        }
        Ok(Some(entries))
    }

    pub async fn write_entries(
        &self,
        artifact: Artifact,
        entries: &[LogEntry],
    ) -> Result<(), StagingError> {
        let contents = render_lines(entries.iter().map(ToString::to_string));
        self.write_atomic(&self.path(artifact), contents).await?;
        debug!("Staged {} entries in {}", entries.len(), artifact.file_name());
        Ok(())
    }

    /// Writes the matched batch as a login line followed by its logout line per record.
    pub async fn write_matched(&self, records: &[MatchedRecord]) -> Result<(), StagingError> {
        let contents = render_lines(records.iter().flat_map(MatchedRecord::lines));
        self.write_atomic(&self.path(Artifact::MatchedBatch), contents)
            .await?;
        debug!("Staged {} matched records", records.len());
        Ok(())
    }

    pub async fn read_matched(&self) -> Result<Option<Vec<MatchedRecord>>, StagingError> {
        let Some(entries) = self.read_entries(Artifact::MatchedBatch).await? else {
            return Ok(None);
        };
        let path = self.path(Artifact::MatchedBatch);

        if entries.len() % 2 != 0 {
            return Err(StagingError::MatchedBatch {
                path,
                reason: format!("odd number of entries ({})", entries.len()),
            });
        }

        let mut records = Vec::with_capacity(entries.len() / 2);
        let mut entries = entries.into_iter();
        while let (Some(login), Some(logout)) = (entries.next(), entries.next()) {
            let description = format!("{login} / {logout}");
            match MatchedRecord::new(login, logout) {
                Some(record) => records.push(record),
                None => {
                    return Err(StagingError::MatchedBatch {
                        path,
                        reason: format!("entries do not form a session: {description}"),
                    })
                }
            }
        }
        Ok(Some(records))
    }

    /// Removes an artifact. Returns whether it existed.
    pub async fn remove(&self, artifact: Artifact) -> Result<bool, StagingError> {
        let path = self.path(artifact);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed {}", artifact.file_name());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StagingError::io(path, e)),
        }
    }

    /// Reads the byte offset of the next unread record, 0 when no checkpoint was ever written.
    pub async fn read_checkpoint(&self) -> Result<u64, StagingError> {
        let path = self.checkpoint_path();
        let Some(contents) = read_optional(&path).await? else {
            return Ok(0);
        };
        let value = contents.lines().next().unwrap_or_default().trim();
        value.parse::<u64>().map_err(|_| StagingError::Checkpoint {
            path,
            value: value.to_string(),
        })
    }

    pub async fn write_checkpoint(&self, offset: u64) -> Result<(), StagingError> {
        self.write_atomic(&self.checkpoint_path(), format!("{offset}\n"))
            .await
    }

    async fn write_atomic(&self, path: &Path, contents: String) -> Result<(), StagingError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StagingError::io(&self.dir, e))?;

        let tmp = tmp_path(path);
        if let Err(e) = write_synced(&tmp, contents.as_bytes()).await {
            discard(&tmp).await;
            return Err(StagingError::io(tmp, e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            discard(&tmp).await;
            return Err(StagingError::io(path, e));
        }
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, StagingError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StagingError::io(path, e)),
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!("Failed to remove temporary file {}: {}", path.display(), e);
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

fn render_lines(lines: impl Iterator<Item = String>) -> String {
    let mut contents = String::new();
    for line in lines {
        contents.push_str(&line);
        contents.push('\n');
    }
    contents
}
