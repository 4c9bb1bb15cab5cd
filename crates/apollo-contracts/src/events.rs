use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for the handler event log (`events.jsonl`).
///
/// - default fields are `type`, `invocation_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
///
/// A disabled writer builds the event but never touches the filesystem.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: Option<PathBuf>,
    invocation_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, invocation_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: Some(path.into()),
                invocation_id: invocation_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: None,
                invocation_id: String::new(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn invocation_id(&self) -> &str {
        &self.inner.invocation_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "invocation_id".to_string(),
            Value::String(self.inner.invocation_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let Some(path) = self.inner.path.as_ref() else {
            return Ok(Value::Object(event));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    /// Emits and drops any sink error. Handlers must not fail because the
    /// log is unwritable.
    pub fn log(&self, event_type: &str, payload: Value) {
        let payload = payload.as_object().cloned().unwrap_or_default();
        if let Err(err) = self.emit(event_type, payload) {
            eprintln!("apollo event log write failed ({event_type}): {err:#}");
        }
    }
}

/// Collapses newlines and truncates free text before it reaches the log.
pub fn summarize_for_log(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ");
    let cleaned = cleaned.trim();
    if cleaned.chars().count() <= max_chars {
        return cleaned.to_string();
    }
    cleaned.chars().take(max_chars).collect::<String>() + "..."
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
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "inv-123");

        let mut payload = EventPayload::new();
        payload.insert("episode_id".to_string(), json!("ep-1"));
        let emitted = writer.emit("panel_images_requested", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], json!("panel_images_requested"));
        assert_eq!(parsed["invocation_id"], json!("inv-123"));
        assert_eq!(parsed["episode_id"], json!("ep-1"));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "inv-123");

        let mut payload = EventPayload::new();
        payload.insert("type".to_string(), json!("override"));
        let emitted = writer.emit("comment_added", payload)?;

        assert_eq!(emitted["type"], json!("override"));
        assert_eq!(emitted["invocation_id"], json!("inv-123"));
        Ok(())
    }

    #[test]
    fn log_appends_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = EventWriter::new(&path, "inv-123");

        writer.log("one", json!({}));
        writer.log("two", json!({"n": 2}));

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(second["type"], json!("two"));
        assert_eq!(second["n"], json!(2));
        Ok(())
    }

    #[test]
    fn disabled_writer_returns_event_without_io() -> anyhow::Result<()> {
        let writer = EventWriter::disabled();
        let emitted = writer.emit("noop", EventPayload::new())?;
        assert_eq!(emitted["type"], json!("noop"));
        assert!(writer.path().is_none());
        Ok(())
    }

    #[test]
    fn summarize_collapses_newlines_and_truncates() {
        assert_eq!(summarize_for_log("  a\nb  ", 50), "a b");
        assert_eq!(summarize_for_log("abcdef", 3), "abc...");
    }
}
