//! Sync progress reporting.
//!
//! Reports observable progress during `taskh sync` so users see which phase
//! the run is in and how much is left. Progress is emitted on **stderr** so
//! stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a sync run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncProgressEvent {
    /// Fetching projects and tasks from the source. Total unknown.
    Fetching,
    /// `n` of `total` fetched tasks have been through the processor.
    Processing { n: u64, total: u64 },
    /// `n` of `total` row writes are durable.
    Storing { n: u64, total: u64 },
    /// `n` tasks missing from the source are being removed.
    Deleting { n: u64 },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the ingestion coordinator.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync  processing  1,234 / 5,000 tasks".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Fetching => "sync  fetching...\n".to_string(),
            SyncProgressEvent::Processing { n, total } => format!(
                "sync  processing  {} / {} tasks\n",
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::Storing { n, total } => format!(
                "sync  storing  {} / {} rows\n",
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::Deleting { n } => {
                format!("sync  deleting  {} tasks\n", format_number(*n))
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

fn event_json(event: &SyncProgressEvent) -> serde_json::Value {
    match event {
        SyncProgressEvent::Fetching => serde_json::json!({
            "event": "progress",
            "phase": "fetching"
        }),
        SyncProgressEvent::Processing { n, total } => serde_json::json!({
            "event": "progress",
            "phase": "processing",
            "n": n,
            "total": total
        }),
        SyncProgressEvent::Storing { n, total } => serde_json::json!({
            "event": "progress",
            "phase": "storing",
            "n": n,
            "total": total
        }),
        SyncProgressEvent::Deleting { n } => serde_json::json!({
            "event": "progress",
            "phase": "deleting",
            "n": n
        }),
    }
}

impl ProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event_json(&event)) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    #[value(name = "none")]
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn json_event_shape() {
        let v = event_json(&SyncProgressEvent::Processing { n: 3, total: 10 });
        assert_eq!(v["phase"], "processing");
        assert_eq!(v["n"], 3);
        assert_eq!(v["total"], 10);
        assert_eq!(event_json(&SyncProgressEvent::Deleting { n: 2 })["phase"], "deleting");
    }
}
