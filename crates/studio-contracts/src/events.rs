use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

pub const SESSION_STARTED: &str = "session_started";
pub const JOB_STARTED: &str = "job_started";
pub const ITEM_RECORDED: &str = "item_recorded";
pub const JOB_FINISHED: &str = "job_finished";
pub const IMAGE_SAVED: &str = "image_saved";
pub const ARTWORK_APPLIED: &str = "artwork_applied";
pub const REFERENCE_ADDED: &str = "reference_added";
pub const SAMPLE_ADDED: &str = "sample_added";

/// Append-only writer for the session's `events.jsonl`.
///
/// Every line carries `type`, `session_id` and `ts`; payload keys are merged
/// after the defaults. A disabled writer accepts events and drops them.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Option<Arc<EventWriterInner>>,
    session_id: String,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Some(Arc::new(EventWriterInner {
                path: path.into(),
                lock: Mutex::new(()),
            })),
            session_id: session_id.into(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            inner: None,
            session_id: "disabled".to_string(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.as_ref().map(|inner| inner.path.as_path())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        event.extend(payload);

        let Some(inner) = self.inner.as_ref() else {
            return Ok(Value::Object(event));
        };
        if let Some(parent) = inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    /// Logging must never take a batch down; failures are reported on stderr.
    pub fn emit_lossy(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.emit(event_type, payload) {
            eprintln!("event log write failed ({event_type}): {err:#}");
        }
    }
}

pub fn payload(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn emit_writes_one_line_per_event_with_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let writer = EventWriter::new(&path, "session-1");

        let emitted = writer.emit(JOB_STARTED, payload(json!({"kind": "artwork", "total": 4})))?;
        writer.emit(JOB_FINISHED, payload(json!({"state": "completed"})))?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0])?;
        assert_eq!(first, emitted);
        assert_eq!(first["type"], json!("job_started"));
        assert_eq!(first["session_id"], json!("session-1"));
        assert_eq!(first["total"], json!(4));
        DateTime::parse_from_rfc3339(first["ts"].as_str().unwrap_or(""))?;

        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(second["state"], json!("completed"));
        Ok(())
    }

    #[test]
    fn payload_keys_override_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "session-1");
        let emitted = writer.emit(
            IMAGE_SAVED,
            payload(json!({"session_id": "other", "filename": "a.png"})),
        )?;
        assert_eq!(emitted["session_id"], json!("other"));
        assert_eq!(emitted["filename"], json!("a.png"));
        Ok(())
    }

    #[test]
    fn disabled_writer_touches_nothing() -> anyhow::Result<()> {
        let writer = EventWriter::disabled();
        let emitted = writer.emit(SESSION_STARTED, EventPayload::new())?;
        assert_eq!(emitted["type"], json!("session_started"));
        assert!(writer.path().is_none());
        Ok(())
    }
}
