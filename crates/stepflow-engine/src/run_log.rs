use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use stepflow_core::types::RunEvent;

/// JSONL run logger.
///
/// Consumes [`RunEvent`]s from the event bus and writes one JSON object per
/// line. The format is append-only: if the process dies mid-run, every
/// previously written line is intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// Create a new RunLogger.
    ///
    /// Logs are written to `{log_dir}/{timestamp}.jsonl`.
    /// `level` controls verbosity: 1=run summary, 2=node outcomes, 3=every event.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Run the logger until cancelled or the bus closes.
    ///
    /// Subscribe before spawning this so no early events are missed. On
    /// cancellation, events already queued on `rx` are still written.
    /// Returns the log file path, or `None` if it couldn't be opened.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<RunEvent>,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%3f").to_string();
        let log_path = self.log_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return None;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Drain whatever is already queued
                    loop {
                        match rx.try_recv() {
                            Ok(event) => {
                                if !self.write_event(&mut writer, &event).await {
                                    break;
                                }
                            }
                            Err(TryRecvError::Lagged(n)) => {
                                debug!(skipped = n, "RunLogger lagged, skipped events");
                            }
                            Err(_) => break,
                        }
                    }
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if !self.write_event(&mut writer, &event).await {
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

        // Final flush
        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
        Some(log_path)
    }

    /// Returns false if writing failed and the logger should stop.
    async fn write_event(
        &self,
        writer: &mut tokio::io::BufWriter<tokio::fs::File>,
        event: &RunEvent,
    ) -> bool {
        let Some(entry) = self.event_to_entry(event) else {
            return true;
        };

        if let Ok(json) = serde_json::to_string(&entry) {
            let line = format!("{}\n", json);
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                error!(error = %e, "Failed to write log entry");
                return false;
            }
            // Flush after each entry for crash resilience
            if let Err(e) = writer.flush().await {
                error!(error = %e, "Failed to flush log");
            }
        }
        true
    }

    /// Convert a RunEvent to a log entry (returns None if filtered by level).
    fn event_to_entry(&self, event: &RunEvent) -> Option<LogEntry> {
        let ts = Utc::now().to_rfc3339();
        let run_id = event.run_id().0.clone();
        let event_type = event.kind().to_string();

        match event {
            // L1: Always logged (run summary)
            RunEvent::RunStarted { context, .. } => Some(LogEntry {
                timestamp: ts,
                run_id,
                event_type,
                node_id: None,
                detail: Some(serde_json::json!({
                    "input": truncate_json(&context["input"], 500),
                })),
            }),
            RunEvent::RunCompleted { path, .. } => Some(LogEntry {
                timestamp: ts,
                run_id,
                event_type,
                node_id: None,
                detail: Some(serde_json::json!({
                    "steps": path.len(),
                    "path": path,
                })),
            }),

            // L2: Node outcomes (level >= 2)
            RunEvent::NodeCompleted { node_id, delta, .. } if self.level >= 2 => Some(LogEntry {
                timestamp: ts,
                run_id,
                event_type,
                node_id: Some(node_id.clone()),
                detail: Some(serde_json::json!({
                    "delta": truncate_json(delta, 500),
                })),
            }),
            RunEvent::NodeFailed { node_id, error, .. } if self.level >= 2 => Some(LogEntry {
                timestamp: ts,
                run_id,
                event_type,
                node_id: Some(node_id.clone()),
                detail: Some(serde_json::json!({ "error": error })),
            }),

            // L3: Every step (level >= 3)
            RunEvent::NodeStarted { node_id, .. } if self.level >= 3 => Some(LogEntry {
                timestamp: ts,
                run_id,
                event_type,
                node_id: Some(node_id.clone()),
                detail: None,
            }),

            _ => None,
        }
    }
}

/// Truncate a JSON value for logging.
fn truncate_json(value: &serde_json::Value, max_len: usize) -> String {
    let s = value.to_string();
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
