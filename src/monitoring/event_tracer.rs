use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

const PROCESS: &str = "evi";

/// One event in the chrome `about://tracing` JSON array format.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub ph: &'static str,
    pub name: String,
    /// Microseconds since the tracer was created.
    pub ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dur: Option<f64>,
    pub pid: &'static str,
    pub tid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

/// Collects duration and instant events for offline timing analysis.
///
/// A disabled tracer accepts every call and records nothing.
pub struct EventTracer {
    enabled: bool,
    origin: Instant,
    events: Mutex<Vec<TraceEvent>>,
}

pub type SharedTracer = Arc<EventTracer>;

impl EventTracer {
    pub fn new(enabled: bool) -> Self {
        EventTracer {
            enabled,
            origin: Instant::now(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn shared(enabled: bool) -> SharedTracer {
        Arc::new(Self::new(enabled))
    }

    pub fn disabled() -> SharedTracer {
        Self::shared(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn now_us(&self) -> f64 {
        self.origin.elapsed().as_nanos() as f64 / 1000.0
    }

    fn record(&self, event: TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn event(&self, ph: &'static str, name: &str, tid: &str, ts: f64) -> TraceEvent {
        TraceEvent {
            ph,
            name: name.to_string(),
            ts,
            dur: None,
            pid: PROCESS,
            tid: tid.to_string(),
            args: None,
        }
    }

    pub fn begin(&self, name: &str, tid: &str) {
        if self.enabled {
            self.record(self.event("B", name, tid, self.now_us()));
        }
    }

    pub fn end(&self, name: &str, tid: &str, args: Option<serde_json::Value>) {
        if self.enabled {
            let mut event = self.event("E", name, tid, self.now_us());
            event.args = args;
            self.record(event);
        }
    }

    pub fn instant(&self, name: &str, tid: &str) {
        if self.enabled {
            self.record(self.event("i", name, tid, self.now_us()));
        }
    }

    /// Start a complete event that is recorded when the returned span drops.
    pub fn complete(self: &Arc<Self>, name: &str, tid: &str) -> CompleteSpan {
        CompleteSpan {
            tracer: self.clone(),
            name: name.to_string(),
            tid: tid.to_string(),
            start: self.now_us(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write all recorded events as a JSON array and clear the buffer.
    pub fn write_to<W: Write>(&self, writer: W) -> Result<usize, serde_json::Error> {
        let events = match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(_) => Vec::new(),
        };
        serde_json::to_writer_pretty(writer, &events)?;
        Ok(events.len())
    }

    pub fn write(&self, path: &Path) -> std::io::Result<usize> {
        let file = BufWriter::new(File::create(path)?);
        let written = self.write_to(file)?;
        log::info!("Wrote {} trace events to {}", written, path.display());
        Ok(written)
    }
}

pub struct CompleteSpan {
    tracer: SharedTracer,
    name: String,
    tid: String,
    start: f64,
}

impl Drop for CompleteSpan {
    fn drop(&mut self) {
        if self.tracer.enabled {
            let mut event = self.tracer.event("X", &self.name, &self.tid, self.start);
            event.dur = Some(self.tracer.now_us() - self.start);
            self.tracer.record(event);
        }
    }
}
