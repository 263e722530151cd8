use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use serde_json::{json, Value};

use crate::TrainingError;

#[derive(Debug, Clone)]
struct Span {
    name: &'static str,
    start: Duration,
    duration: Duration,
}

/// Collects named phase timings for one batch step.
#[derive(Debug)]
pub struct TraceRecorder {
    origin: Instant,
    spans: Vec<Span>,
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            spans: Vec::new(),
        }
    }

    pub fn record<T>(&mut self, name: &'static str, f: impl FnOnce() -> T) -> T {
        let start = self.origin.elapsed();
        let begin = Instant::now();
        let out = f();
        self.spans.push(Span {
            name,
            start,
            duration: begin.elapsed(),
        });
        out
    }

    /// Total time per phase, in first-seen order.
    pub fn totals(&self) -> Vec<(&'static str, Duration)> {
        let mut totals: Vec<(&'static str, Duration)> = Vec::new();
        for span in &self.spans {
            match totals.iter_mut().find(|(name, _)| *name == span.name) {
                Some((_, total)) => *total += span.duration,
                None => totals.push((span.name, span.duration)),
            }
        }
        totals
    }

    /// Chrome trace-event JSON (`chrome://tracing`, Perfetto).
    pub fn to_chrome_trace(&self) -> Value {
        let events: Vec<Value> = self
            .spans
            .iter()
            .map(|span| {
                json!({
                    "name": span.name,
                    "ph": "X",
                    "ts": span.start.as_micros() as u64,
                    "dur": span.duration.as_micros() as u64,
                    "pid": std::process::id(),
                    "tid": 0,
                })
            })
            .collect();
        json!({ "traceEvents": events })
    }

    pub fn write(&self, path: &Path) -> Result<(), TrainingError> {
        let data = serde_json::to_vec(&self.to_chrome_trace()).map_err(|err| {
            TrainingError::runtime(format!("failed to serialize trace: {err}"))
        })?;
        fs::write(path, data).map_err(|err| {
            TrainingError::runtime(format!("failed to write trace {}: {err}", path.display()))
        })
    }
}

/// Runs `f` as phase `name` when a recorder is active.
pub(crate) fn phase<T>(
    recorder: &mut Option<TraceRecorder>,
    name: &'static str,
    f: impl FnOnce() -> T,
) -> T {
    match recorder {
        Some(recorder) => recorder.record(name, f),
        None => f(),
    }
}

/// `trace.json` becomes `trace.{counter}.json`.
pub fn trace_path(template: &Path, counter: usize) -> PathBuf {
    match template.extension().and_then(|ext| ext.to_str()) {
        Some("json") => template.with_extension(format!("{counter}.json")),
        _ => {
            let mut name = template.as_os_str().to_os_string();
            name.push(format!(".{counter}"));
            PathBuf::from(name)
        }
    }
}
