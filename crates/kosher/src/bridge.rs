// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Execution bridge: relays a remote process's output incrementally and
//! reports how it ended.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::cancel::CancelToken;
use crate::engine::{EngineError, OutputChunk, RemoteProcess};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./bridge_test.rs"]
mod bridge_test;

/// Output lines buffered between the process and a slow consumer.
const OUTPUT_BUFFER: usize = 256;

/// How a streamed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Exited(i32),
    /// Interrupted by the caller; the process was signalled to stop.
    Cancelled,
    /// Exceeded its time budget; the process was signalled to stop.
    TimedOut,
}

impl ExecStatus {
    /// Numeric exit code, if the process exited on its own.
    pub fn code(self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(code),
            Self::Cancelled | Self::TimedOut => None,
        }
    }

    pub fn success(self) -> bool {
        self == Self::Exited(0)
    }
}

/// Fully collected result of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
}

/// A live command: a stream of output chunks plus a terminal status.
///
/// Dropping the stream without calling [`ExecStream::finish`] leaves the
/// process running until it exits on its own.
pub struct ExecStream {
    rx: mpsc::Receiver<OutputChunk>,
    status: oneshot::Receiver<std::result::Result<ExecStatus, EngineError>>,
    cancel: CancelToken,
}

impl std::fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecStream")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ExecStream {
    /// Token that interrupts this command when cancelled.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Discard any remaining output and wait for the terminal status.
    pub async fn finish(mut self) -> Result<ExecStatus> {
        while self.rx.recv().await.is_some() {}
        self.status().await
    }

    /// Drain all output and return it together with the terminal status.
    pub async fn collect(mut self) -> Result<RunOutput> {
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = self.rx.recv().await {
            let (buf, line) = match chunk {
                OutputChunk::Stdout(line) => (&mut stdout, line),
                OutputChunk::Stderr(line) => (&mut stderr, line),
            };
            buf.push_str(&line);
            buf.push('\n');
        }
        let status = self.status().await?;
        Ok(RunOutput {
            status,
            stdout,
            stderr,
        })
    }

    async fn status(self) -> Result<ExecStatus> {
        let outcome = self.status.await.unwrap_or_else(|_| {
            Err(EngineError::new("execution bridge stopped before the process ended"))
        });
        outcome.map_err(|source| Error::Engine {
            operation: "Waiting for command".to_string(),
            source,
        })
    }
}

impl Stream for ExecStream {
    type Item = OutputChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Attach to `process`, relaying its output until it exits, `cancel` fires
/// or `timeout` elapses. Interrupted processes are killed.
pub fn stream(
    process: Box<dyn RemoteProcess>,
    cancel: CancelToken,
    timeout: Option<Duration>,
) -> ExecStream {
    let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
    let (status_tx, status_rx) = oneshot::channel();
    tokio::spawn(pump(process, tx, cancel.clone(), timeout, status_tx));
    ExecStream {
        rx,
        status: status_rx,
        cancel,
    }
}

enum Interrupt {
    Cancelled,
    TimedOut,
}

async fn pump(
    mut process: Box<dyn RemoteProcess>,
    tx: mpsc::Sender<OutputChunk>,
    cancel: CancelToken,
    timeout: Option<Duration>,
    status_tx: oneshot::Sender<std::result::Result<ExecStatus, EngineError>>,
) {
    let deadline = async {
        match timeout {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let relayed: std::result::Result<(), Interrupt> = async {
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
                _ = &mut deadline => return Err(Interrupt::TimedOut),
                chunk = process.next_chunk() => chunk,
            };
            let Some(chunk) = chunk else {
                return Ok(());
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
                _ = &mut deadline => return Err(Interrupt::TimedOut),
                // A dropped consumer only stops relaying; the process still
                // runs to completion.
                _ = tx.send(chunk) => {}
            }
        }
    }
    .await;
    drop(tx);

    let outcome = match relayed {
        Ok(()) => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = &mut deadline => Err(Interrupt::TimedOut),
            code = process.wait() => Ok(code),
        },
        Err(interrupt) => Err(interrupt),
    };

    let status = match outcome {
        Ok(code) => code.map(ExecStatus::Exited),
        Err(interrupt) => {
            if let Err(err) = process.kill().await {
                tracing::warn!("Failed to stop interrupted process: {err}");
            }
            Ok(match interrupt {
                Interrupt::Cancelled => ExecStatus::Cancelled,
                Interrupt::TimedOut => ExecStatus::TimedOut,
            })
        }
    };
    tracing::debug!(?status, "remote process finished");
    let _ = status_tx.send(status);
}
