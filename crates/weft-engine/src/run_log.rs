use std::path::PathBuf;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::event::{EventBus, RunSubscription};
use weft_core::{NodeId, RunEvent, TraceEvent};

/// JSONL run logger.
///
/// Subscribes to the EventBus and writes one JSON object per trace entry to
/// `{log_dir}/{run_id}.jsonl`. Lines are flushed as they are written, so a
/// crashed run still leaves everything up to the crash.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    seq: usize,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1=summary, 2=node lifecycle, 3=outputs.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and log in a background task. The task resolves to
    /// the log file path once the run finishes.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<Option<PathBuf>> {
        let events = event_bus.subscribe();
        tokio::spawn(self.run(events, cancel))
    }

    /// Write entries until cancellation or the end of the run.
    pub async fn run(
        self,
        mut events: RunSubscription,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let mut writer: Option<(PathBuf, tokio::io::BufWriter<tokio::fs::File>)> = None;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                next = events.next() => match next {
                    Some(event) => event,
                    None => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                }
            };

            if writer.is_none() {
                let path = self.log_dir.join(format!("{}.jsonl", event.run_id));
                match tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                {
                    Ok(file) => {
                        info!(path = %path.display(), "RunLogger started");
                        writer = Some((path, tokio::io::BufWriter::new(file)));
                    }
                    Err(e) => {
                        error!(error = %e, path = %path.display(), "Failed to open log file");
                        return None;
                    }
                }
            }

            if let (Some(entry), Some((_, w))) = (self.event_to_entry(&event), writer.as_mut()) {
                if let Ok(json) = serde_json::to_string(&entry) {
                    let line = format!("{}\n", json);
                    if let Err(e) = w.write_all(line.as_bytes()).await {
                        error!(error = %e, "Failed to write log entry");
                        break;
                    }
                    if let Err(e) = w.flush().await {
                        error!(error = %e, "Failed to flush log");
                    }
                }
            }

            if event.is_finished() {
                break;
            }
        }

        if events.missed() > 0 {
            warn!(missed = events.missed(), "RunLogger fell behind, entries were dropped");
        }
        let (path, mut w) = writer?;
        w.flush().await.ok();
        debug!(path = %path.display(), "RunLogger finished");
        Some(path)
    }

    /// Convert a run event to a log entry (None if filtered by level).
    fn event_to_entry(&self, event: &RunEvent) -> Option<LogEntry> {
        let required = match &event.entry.event {
            TraceEvent::RunStarted
            | TraceEvent::RunFinished { .. }
            | TraceEvent::NodeFailed { .. }
            | TraceEvent::CheckpointReached { .. }
            | TraceEvent::Steered { .. }
            | TraceEvent::SteeringRejected { .. }
            | TraceEvent::GraphReplaced { .. }
            | TraceEvent::LoopLimitReached { .. } => 1,
            TraceEvent::NodeCompleted { .. } | TraceEvent::VariableBound { .. } => 3,
            _ => 2,
        };
        if self.level < required {
            return None;
        }

        let mut value = serde_json::to_value(&event.entry.event).ok()?;
        let object = value.as_object_mut()?;
        let event_type = object
            .remove("type")
            .and_then(|t| t.as_str().map(str::to_string))
            .unwrap_or_default();
        let detail = (!object.is_empty()).then(|| value);

        Some(LogEntry {
            timestamp: event.entry.at.to_rfc3339(),
            run_id: event.run_id.to_string(),
            seq: event.entry.seq,
            event_type,
            node: event.entry.node,
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use weft_core::{RunId, RunStatus, TraceEntry};

    fn event(seq: usize, node: Option<u64>, event: TraceEvent) -> RunEvent {
        RunEvent {
            run_id: RunId("run-1".into()),
            entry: TraceEntry {
                seq,
                at: Utc::now(),
                node: node.map(NodeId),
                event,
            },
        }
    }

    #[test]
    fn test_entry_shape() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 3);
        let entry = logger
            .event_to_entry(&event(
                4,
                Some(2),
                TraceEvent::NodeFailed {
                    error: "boom".into(),
                },
            ))
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event_type\":\"node_failed\""));
        assert!(json.contains("\"node\":2"));
        assert!(json.contains("\"error\":\"boom\""));

        let started = logger
            .event_to_entry(&event(0, None, TraceEvent::RunStarted))
            .unwrap();
        let json = serde_json::to_string(&started).unwrap();
        // Should not contain "node" or "detail" (they're None and skip_serializing_if)
        assert!(!json.contains("node"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_event_level_filtering() {
        let completed = event(
            1,
            Some(0),
            TraceEvent::NodeCompleted {
                output: "long output".into(),
            },
        );
        let dispatched = event(
            1,
            Some(0),
            TraceEvent::NodeDispatched {
                agent: "explore".into(),
                instruction: "x".into(),
            },
        );

        let summary = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(summary.event_to_entry(&dispatched).is_none());
        assert!(summary.event_to_entry(&completed).is_none());

        let lifecycle = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(lifecycle.event_to_entry(&dispatched).is_some());
        assert!(lifecycle.event_to_entry(&completed).is_none());

        let full = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(full.event_to_entry(&completed).is_some());
    }

    #[tokio::test]
    async fn test_writes_until_run_finished() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let handle = RunLogger::new(dir.path().to_path_buf(), 2).spawn(&bus, CancellationToken::new());

        let publish = |e: RunEvent| bus.publish(&e.run_id, e.entry);
        publish(event(0, None, TraceEvent::RunStarted));
        publish(event(
            1,
            Some(0),
            TraceEvent::NodeDispatched {
                agent: "explore".into(),
                instruction: "x".into(),
            },
        ));
        publish(event(
            2,
            None,
            TraceEvent::RunFinished {
                status: RunStatus::Completed,
            },
        ));

        let path = handle.await.unwrap().unwrap();
        assert_eq!(path, dir.path().join("run-1.jsonl"));
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains("run_finished"));
        assert!(lines[2].contains("\"status\":\"completed\""));
    }
}
