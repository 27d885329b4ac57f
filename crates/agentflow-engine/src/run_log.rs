use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use agentflow_core::event::EventBus;
use agentflow_core::types::{ExecutionId, FlowEvent};

/// JSONL execution logger.
///
/// Follows one execution on the EventBus and appends one JSON object per
/// line to `{log_dir}/{execution_id}.jsonl`. Every entry is flushed, so a
/// crash mid-run leaves all earlier lines intact.
pub struct RunLogger {
    log_dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn path_for(&self, execution_id: &ExecutionId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", execution_id))
    }

    /// Subscribe now and write in a background task.
    ///
    /// Subscribing before the task starts means no event published after
    /// this call returns can be missed.
    pub fn spawn(
        self,
        events: &EventBus,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = events.subscribe();
        tokio::spawn(self.run(rx, execution_id, cancel))
    }

    /// Write entries for `execution_id` until its terminal event or cancellation.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<FlowEvent>,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let log_path = self.path_for(&execution_id);
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.execution_id() != &execution_id {
                                continue;
                            }

                            if let Ok(json) = serde_json::to_string(&entry_for(&event)) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if event.is_terminal() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }
}

fn entry_for(event: &FlowEvent) -> LogEntry {
    let mut entry = LogEntry {
        timestamp: Utc::now().to_rfc3339(),
        execution_id: event.execution_id().to_string(),
        event_type: "",
        node_id: None,
        attempt: None,
        detail: None,
    };

    match event {
        FlowEvent::ExecutionStarted { flow_id, .. } => {
            entry.event_type = "execution_started";
            entry.detail = Some(serde_json::json!({ "flow_id": flow_id }));
        }
        FlowEvent::NodeStarted {
            node_id, attempt, ..
        } => {
            entry.event_type = "node_started";
            entry.node_id = Some(node_id.clone());
            entry.attempt = Some(*attempt);
        }
        FlowEvent::NodeRetrying {
            node_id,
            attempt,
            backoff_ms,
            error,
            ..
        } => {
            entry.event_type = "node_retrying";
            entry.node_id = Some(node_id.clone());
            entry.attempt = Some(*attempt);
            entry.detail = Some(serde_json::json!({ "backoff_ms": backoff_ms, "error": error }));
        }
        FlowEvent::NodeCompleted {
            node_id,
            attempt,
            duration_ms,
            ..
        } => {
            entry.event_type = "node_completed";
            entry.node_id = Some(node_id.clone());
            entry.attempt = Some(*attempt);
            entry.detail = Some(serde_json::json!({ "duration_ms": duration_ms }));
        }
        FlowEvent::NodeFailed {
            node_id,
            attempt,
            error,
            ..
        } => {
            entry.event_type = "node_failed";
            entry.node_id = Some(node_id.clone());
            entry.attempt = Some(*attempt);
            entry.detail = Some(serde_json::json!({ "error": error }));
        }
        FlowEvent::ExecutionCompleted { duration_ms, .. } => {
            entry.event_type = "execution_completed";
            entry.detail = Some(serde_json::json!({ "duration_ms": duration_ms }));
        }
        FlowEvent::ExecutionFailed { kind, error, .. } => {
            entry.event_type = "execution_failed";
            entry.detail = Some(serde_json::json!({ "kind": kind, "error": error }));
        }
    }

    entry
}
