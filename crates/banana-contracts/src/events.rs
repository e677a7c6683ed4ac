use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

pub const EVENTS_FILE: &str = "events.jsonl";

/// Structured session log.
///
/// - default fields are `type`, `session_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - file sinks append one compact JSON object per line
/// - memory sinks keep the events for inspection via [`EventWriter::captured`]
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    sink: Sink,
    session_id: String,
    lock: Mutex<Vec<Value>>,
    failed: AtomicBool,
}

#[derive(Debug)]
enum Sink {
    File(PathBuf),
    Memory,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self::with_sink(Sink::File(path.into()), session_id.into())
    }

    pub fn memory(session_id: impl Into<String>) -> Self {
        Self::with_sink(Sink::Memory, session_id.into())
    }

    fn with_sink(sink: Sink, session_id: String) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                sink,
                session_id,
                lock: Mutex::new(Vec::new()),
                failed: AtomicBool::new(false),
            }),
        }
    }

    /// `None` for memory sinks.
    pub fn path(&self) -> Option<&Path> {
        match &self.inner.sink {
            Sink::File(path) => Some(path),
            Sink::Memory => None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }
        let event = Value::Object(event);

        let mut captured = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        match &self.inner.sink {
            Sink::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let line = serde_json::to_string(&event)?;
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
            Sink::Memory => captured.push(event.clone()),
        }

        Ok(event)
    }

    /// [`emit`](Self::emit) for callers without an error channel. The first
    /// failed write is reported on stderr; later failures only set
    /// [`has_failed`](Self::has_failed).
    pub fn record(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.emit(event_type, payload) {
            if !self.inner.failed.swap(true, Ordering::SeqCst) {
                eprintln!("event log write failed, further failures are not reported: {err:#}");
            }
        }
    }

    pub fn has_failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// Events held by a memory sink, oldest first. Always empty for file
    /// sinks.
    pub fn captured(&self) -> Vec<Value> {
        self.inner
            .lock
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Types of the captured events, in order.
    pub fn captured_types(&self) -> Vec<String> {
        self.captured()
            .iter()
            .filter_map(|event| event.get("type").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Builds an [`EventPayload`] from `key => value` pairs.
#[macro_export]
macro_rules! payload {
    ($($key:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut payload = $crate::events::EventPayload::new();
        $(payload.insert($key.to_string(), ::serde_json::json!($value));)*
        payload
    }};
}
