// ABOUTME: Typed run events for streaming transports and the worker task that produces them
// ABOUTME: Zero or more log events are followed by exactly one result or error event

use crate::error::{EngineError, Result};
use crate::supervisor::SandboxEngine;
use crate::types::{LogSink, RunOutcome, RunRequest, SandboxExecutionResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Log { lines: Vec<String> },
    Result { data: SandboxExecutionResult },
    Error { detail: String },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunEvent::Log { .. })
    }
}

/// A run executing on its own task
pub struct RunHandle {
    events: mpsc::UnboundedReceiver<RunEvent>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<Option<RunOutcome>>,
}

impl RunHandle {
    /// Next event, `None` once the terminal event has been taken
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    /// Ask the run to stop. Logs and artifacts gathered so far are still returned.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the worker. `None` means the run ended with an error event.
    pub async fn join(self) -> Result<Option<RunOutcome>> {
        self.task
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))
    }
}

impl SandboxEngine {
    /// Run `request` on a dedicated task, streaming its events
    pub fn spawn_run(&self, request: RunRequest) -> RunHandle {
        let (tx, events) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = watch::channel(false);
        let engine = self.clone();

        let log_tx = tx.clone();
        let sink: LogSink = Arc::new(move |lines: &[String]| {
            let _ = log_tx.send(RunEvent::Log {
                lines: lines.to_vec(),
            });
        });

        let task = tokio::spawn(async move {
            match engine.execute_with_cancel(&request, Some(sink), cancel_rx).await {
                Ok(outcome) => {
                    let _ = tx.send(RunEvent::Result {
                        data: outcome.result.clone(),
                    });
                    Some(outcome)
                }
                Err(e) => {
                    debug!("Run failed before producing a result: {}", e);
                    let _ = tx.send(RunEvent::Error {
                        detail: e.to_string(),
                    });
                    None
                }
            }
        });

        RunHandle {
            events,
            cancel,
            task,
        }
    }
}
