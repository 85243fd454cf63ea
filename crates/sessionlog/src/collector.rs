// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector server that receives matched sessions from agents.
//!
//! Each agent connection is handled on its own task, bounded by a fixed number of slots.
//! Handlers never touch the output log: they push every received line to the
//! [`WriterService`](crate::writer_service::WriterService) through a [`WriterHandle`], and
//! the writer appends them in arrival order.
//!
//! A connection moves through `Accepted -> Reading -> Completed | Failed -> Closed`. A batch
//! is `Completed` once its sentinel line arrives and is answered with `OK`; any error,
//! including the agent hanging up early, makes it `Failed` and is answered with `ERROR`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::config::CollectorConfig;
use crate::constants::{ACK_ERROR, ACK_OK, SENTINEL};
use crate::errors::{CollectorError, IngestError};
use crate::writer_service::WriterHandle;

/// Collector server to accept agent connections and queue their lines for the writer.
pub struct Collector {
    cancel_token: CancellationToken,
    writer_handle: WriterHandle,
    listener: TcpListener,
    slots: Arc<Semaphore>,
}

impl Collector {
    /// Binds the listener. Lines received are forwarded to `writer_handle`.
    pub async fn new(
        config: &CollectorConfig,
        writer_handle: WriterHandle,
        cancel_token: CancellationToken,
    ) -> Result<Collector, CollectorError> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| CollectorError::Bind { addr, source })?;

        Ok(Collector {
            cancel_token,
            writer_handle,
            listener,
            slots: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Runs until the cancel token fires.
    ///
    /// A slot is claimed before accepting, so once every slot is busy new agents wait in the
    /// listen backlog instead of being turned away.
    pub async fn spin(self) {
        loop {
            let permit = tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (socket, peer) = tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let writer_handle = self.writer_handle.clone();
            tokio::spawn(async move {
                handle_connection(socket, peer, &writer_handle).await;
                drop(permit);
            });
        }
        debug!("Collector stopped accepting connections");
    }
}

/// Outcome of reading one agent batch.
#[derive(Debug)]
pub enum BatchOutcome {
    Completed { lines: usize },
    Failed(IngestError),
}

impl BatchOutcome {
    pub fn ack(&self) -> &'static str {
        match self {
            BatchOutcome::Completed { .. } => ACK_OK,
            BatchOutcome::Failed(_) => ACK_ERROR,
        }
    }
}

async fn handle_connection(mut socket: TcpStream, peer: SocketAddr, writer: &WriterHandle) {
    debug!("Accepted connection from {}", peer);
    let (read_half, mut write_half) = socket.split();

    let outcome = match read_batch(read_half, writer).await {
        Ok(lines) => BatchOutcome::Completed { lines },
        Err(e) => BatchOutcome::Failed(e),
    };
    match &outcome {
        BatchOutcome::Completed { lines } => debug!("Received {} lines from {}", lines, peer),
        BatchOutcome::Failed(e) => warn!("Batch from {} failed: {}", peer, e),
    }

    let reply = format!("{}\n", outcome.ack());
    if let Err(e) = write_half.write_all(reply.as_bytes()).await {
        debug!("Could not acknowledge {}: {}", peer, e);
    }
    if let Err(e) = write_half.shutdown().await {
        trace!("Error closing connection to {}: {}", peer, e);
    }
    debug!("Closed connection from {}", peer);
}

/// Queues every line up to the sentinel. Returns how many lines were queued.
async fn read_batch<R>(reader: R, writer: &WriterHandle) -> Result<usize, IngestError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut queued = 0;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end_matches('\r');
        if line == SENTINEL {
            return Ok(queued);
        }
        if line.trim().is_empty() {
            continue;
        }
        trace!("Queueing line: {}", line);
        if writer.append(line.to_string()).is_err() {
            error!("Writer service is gone, dropping batch");
            return Err(IngestError::WriterStopped);
        }
        queued += 1;
    }
    Err(IngestError::MissingSentinel(queued))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::writer_service::WriterService;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    struct Harness {
        _dir: tempfile::TempDir,
        log_path: std::path::PathBuf,
        addr: SocketAddr,
        handle: WriterHandle,
        cancel_token: CancellationToken,
        writer_task: tokio::task::JoinHandle<()>,
    }

    async fn start_collector(max_connections: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("server-log.txt");
        let (service, handle) = WriterService::new(&log_path).await.unwrap();
        let writer_task = tokio::spawn(service.run());

        let config = CollectorConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            output_log: log_path.clone(),
            max_connections,
            log_level: "info".to_string(),
        };
        let cancel_token = CancellationToken::new();
        let collector = Collector::new(&config, handle.clone(), cancel_token.clone())
            .await
            .unwrap();
        let addr = collector.local_addr().unwrap();
        tokio::spawn(collector.spin());

        Harness {
            _dir: dir,
            log_path,
            addr,
            handle,
            cancel_token,
            writer_task,
        }
    }

    impl Harness {
        async fn stop(self) -> String {
            self.cancel_token.cancel();
            self.handle.flush().await.unwrap();
            self.handle.shutdown().unwrap();
            self.writer_task.await.unwrap();
            std::fs::read_to_string(&self.log_path).unwrap()
        }
    }

    async fn send_batch(addr: SocketAddr, payload: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(payload.as_bytes()).await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_batch_is_acknowledged_and_logged() {
        let harness = start_collector(10).await;
        let reply = send_batch(harness.addr, "a,1,7,1,h\na,1,8,2,h\nover\n").await;
        assert_eq!(reply, "OK\n");
        assert_eq!(harness.stop().await, "a,1,7,1,h\na,1,8,2,h\n");
    }

    #[tokio::test]
    async fn test_crlf_sentinel_is_recognized() {
        let harness = start_collector(10).await;
        let reply = send_batch(harness.addr, "a,1,7,1,h\r\nover\r\n").await;
        assert_eq!(reply, "OK\n");
        assert_eq!(harness.stop().await, "a,1,7,1,h\n");
    }

    #[tokio::test]
    async fn test_blank_lines_are_not_logged() {
        let harness = start_collector(10).await;
        let reply = send_batch(harness.addr, "a,1,7,1,h\n\n   \r\na,1,8,2,h\nover\n").await;
        assert_eq!(reply, "OK\n");
        assert_eq!(harness.stop().await, "a,1,7,1,h\na,1,8,2,h\n");
    }

    #[tokio::test]
    async fn test_missing_sentinel_is_answered_with_error() {
        let harness = start_collector(10).await;

        let mut stream = TcpStream::connect(harness.addr).await.unwrap();
        stream.write_all(b"a,1,7,1,h\n").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();

        assert_eq!(reply, "ERROR\n");
        // Lines already queued are kept; the agent retries and the log may repeat them.
        assert_eq!(harness.stop().await, "a,1,7,1,h\n");
    }

    #[tokio::test]
    async fn test_concurrent_batches_are_all_logged_once() {
        let harness = start_collector(4).await;
        let clients = 16;
        let lines_per_client = 25;

        let mut tasks = Vec::new();
        for client in 0..clients {
            let addr = harness.addr;
            tasks.push(tokio::spawn(async move {
                let mut payload = String::new();
                for line in 0..lines_per_client {
                    payload.push_str(&format!("user{client},{line},8,0,h\n"));
                }
                payload.push_str("over\n");
                send_batch(addr, &payload).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), "OK\n");
        }

        let log = harness.stop().await;
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for line in log.lines() {
            *counts.entry(line).or_default() += 1;
        }
        assert_eq!(counts.len(), clients * lines_per_client);
        assert!(counts.values().all(|&count| count == 1));

        // Lines of one batch keep their relative order.
        let client0: Vec<&str> = log.lines().filter(|l| l.starts_with("user0,")).collect();
        let expected: Vec<String> = (0..lines_per_client)
            .map(|line| format!("user0,{line},8,0,h"))
            .collect();
        assert_eq!(client0, expected);
    }

    #[tokio::test]
    async fn test_saturated_slots_hold_new_connections() {
        let harness = start_collector(1).await;

        // The first agent holds the only slot by not finishing its batch.
        let mut first = TcpStream::connect(harness.addr).await.unwrap();
        first.write_all(b"first,1,7,1,h\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let addr = harness.addr;
        let second = tokio::spawn(async move { send_batch(addr, "second,2,7,1,h\nover\n").await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!second.is_finished());

        first.write_all(b"over\n").await.unwrap();
        let mut reply = String::new();
        first.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, "OK\n");

        assert_eq!(second.await.unwrap(), "OK\n");
        assert_eq!(harness.stop().await, "first,1,7,1,h\nsecond,2,7,1,h\n");
    }

    #[tokio::test]
    async fn test_stopped_writer_fails_batch() {
        let harness = start_collector(10).await;
        harness.handle.shutdown().unwrap();
        // Wait for the writer to drop its receiver.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reply = send_batch(harness.addr, "a,1,7,1,h\nover\n").await;
        assert_eq!(reply, "ERROR\n");
        harness.cancel_token.cancel();
    }

    #[test]
    fn test_batch_outcome_ack() {
        assert_eq!(BatchOutcome::Completed { lines: 0 }.ack(), "OK");
        assert_eq!(
            BatchOutcome::Failed(IngestError::MissingSentinel(3)).ack(),
            "ERROR"
        );
    }
}
