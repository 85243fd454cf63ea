// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::errors::CollectorError;

#[derive(Debug)]
pub enum WriterCommand {
    Append(String),
    /// Writes everything queued ahead of it, flushes the log and answers with the number of
    /// lines written since the service started.
    Flush(oneshot::Sender<u64>),
    Shutdown,
}

/// Cheap to clone; every connection handler gets its own copy.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl WriterHandle {
    pub fn append(&self, line: String) -> Result<(), mpsc::error::SendError<WriterCommand>> {
        self.tx.send(WriterCommand::Append(line))
    }

    pub async fn flush(&self) -> Result<u64, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(response_tx))
            .map_err(|e| format!("Failed to send flush command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive flush response: {}", e))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<WriterCommand>> {
        self.tx.send(WriterCommand::Shutdown)
    }
}

/// Sole owner of the output log. Lines arrive from any number of handles over an unbounded
/// channel and are appended in the order they were queued.
pub struct WriterService {
    path: PathBuf,
    log: BufWriter<tokio::fs::File>,
    rx: mpsc::UnboundedReceiver<WriterCommand>,
    written: u64,
}

impl WriterService {
    pub async fn new(path: impl AsRef<Path>) -> Result<(Self, WriterHandle), CollectorError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| CollectorError::OutputLog {
                path: path.clone(),
                source,
            })?;
        let (tx, rx) = mpsc::unbounded_channel();

        let service = Self {
            path,
            log: BufWriter::new(file),
            rx,
            written: 0,
        };
        let handle = WriterHandle { tx };

        Ok((service, handle))
    }

    /// Drains whatever is queued, flushes once the queue is empty, then sleeps until more
    /// work arrives. Stops on `Shutdown` or once every handle has been dropped.
    pub async fn run(mut self) {
        debug!("Writer service started on {}", self.path.display());

        'serve: loop {
            while let Ok(command) = self.rx.try_recv() {
                if !self.handle(command).await {
                    break 'serve;
                }
            }
            self.flush_log().await;

            match self.rx.recv().await {
                Some(command) => {
                    if !self.handle(command).await {
                        break 'serve;
                    }
                }
                None => break 'serve,
            }
        }

        self.flush_log().await;
        debug!(
            "Writer service stopped after writing {} lines",
            self.written
        );
    }

    /// Returns false once the service should stop.
    async fn handle(&mut self, command: WriterCommand) -> bool {
        match command {
            WriterCommand::Append(line) => {
                self.append(&line).await;
                true
            }
            WriterCommand::Flush(response_tx) => {
                // The channel is FIFO, so every command queued ahead of this one is handled.
                self.flush_log().await;
                if response_tx.send(self.written).is_err() {
                    error!("Failed to send flush response - receiver dropped");
                }
                true
            }
            WriterCommand::Shutdown => {
                debug!("Writer service shutting down");
                false
            }
        }
    }

    async fn append(&mut self, line: &str) {
        let result = async {
            self.log.write_all(line.as_bytes()).await?;
            self.log.write_all(b"\n").await
        }
        .await;
        match result {
            Ok(()) => self.written += 1,
            Err(e) => error!(
                "Failed to append to {}: {}; line lost: {}",
                self.path.display(),
                e,
                line
            ),
        }
    }

    async fn flush_log(&mut self) {
        if let Err(e) = self.log.flush().await {
            error!("Failed to flush {}: {}", self.path.display(), e);
        }
    }
}
