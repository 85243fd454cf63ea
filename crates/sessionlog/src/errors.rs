// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for every stage of the session pipeline.

use std::path::PathBuf;

/// Errors produced while decoding a fixed-width binary record.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Fewer bytes than one full record are available. Not a hard failure: the
    /// tail of the stream is still being written.
    #[error("insufficient data: got {got} bytes, a record needs {needed}")]
    Insufficient { got: usize, needed: usize },
}

/// Errors produced while parsing a staged `user,pid,type,time,host` line.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum LineError {
    #[error("expected 5 comma separated fields, got {0}")]
    FieldCount(usize),

    #[error("invalid {field} value '{value}'")]
    InvalidField { field: &'static str, value: String },
}

/// Errors produced by the file-backed staging store.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed line {line_no} in {}: {source}", path.display())]
    Line {
        path: PathBuf,
        line_no: usize,
        #[source]
        source: LineError,
    },

    #[error("malformed checkpoint in {}: '{value}'", path.display())]
    Checkpoint { path: PathBuf, value: String },

    #[error("matched batch {} is corrupt: {reason}", path.display())]
    MatchedBatch { path: PathBuf, reason: String },
}

impl StagingError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StagingError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors produced by the parse stage.
#[derive(Debug, thiserror::Error)]
pub enum ParseStageError {
    #[error("record stream {} is unavailable: {source}", path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed reading record stream {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed decoding record at offset {offset}: {source}")]
    Decode {
        offset: u64,
        #[source]
        source: DecodeError,
    },

    #[error(transparent)]
    Staging(#[from] StagingError),
}

/// Errors produced by the pairing stage.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error(transparent)]
    Staging(#[from] StagingError),
}

/// Errors produced while delivering a matched batch to the collector.
#[derive(Debug, thiserror::Error)]
pub enum TransmitError {
    #[error("failed to connect to collector at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0:?} while {1}")]
    Timeout(std::time::Duration, &'static str),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("collector closed the connection without acknowledging")]
    NoAcknowledgement,

    #[error(transparent)]
    Staging(#[from] StagingError),
}

/// Errors produced by the collector.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("failed to bind collector to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open output log {}: {source}", path.display())]
    OutputLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that fail one collector connection. The agent is answered with `ERROR`.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The agent hung up before the sentinel. Lines read so far stay queued, yet the batch is
    /// still answered with `ERROR` rather than `OK`, so the agent keeps and resends it.
    #[error("connection closed after {0} lines without the end-of-batch sentinel")]
    MissingSentinel(usize),

    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("writer service is not running")]
    WriterStopped,
}

/// Errors produced while building configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
