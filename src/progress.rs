//! Rebuild and import progress reporting.
//!
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.
//! Reporters implement the core's [`ProgressSink`].

use std::io::Write;

use dms_search_core::collaborators::{NoProgress, ProgressSink};

/// Human-friendly progress on stderr: "reindex  1,234 / 5,000 nodes".
pub struct StderrProgress {
    label: String,
}

impl StderrProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    fn emit(&self, line: String) {
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

impl ProgressSink for StderrProgress {
    fn started(&self, total: u64) {
        self.emit(format!("{}  starting  {} nodes\n", self.label, format_number(total)));
    }

    fn advanced(&self, processed: u64, total: u64) {
        self.emit(format!(
            "{}  {} / {} nodes\n",
            self.label,
            format_number(processed),
            format_number(total)
        ));
    }

    fn finished(&self, processed: u64, failed: u64) {
        self.emit(format!(
            "{}  done  {} processed, {} failed\n",
            self.label,
            format_number(processed),
            format_number(failed)
        ));
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress {
    label: String,
}

impl JsonProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    fn emit(&self, obj: serde_json::Value) {
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

impl ProgressSink for JsonProgress {
    fn started(&self, total: u64) {
        self.emit(serde_json::json!({
            "event": "started",
            "operation": self.label,
            "total": total
        }));
    }

    fn advanced(&self, processed: u64, total: u64) {
        self.emit(serde_json::json!({
            "event": "progress",
            "operation": self.label,
            "n": processed,
            "total": total
        }));
    }

    fn finished(&self, processed: u64, failed: u64) {
        self.emit(serde_json::json!({
            "event": "finished",
            "operation": self.label,
            "processed": processed,
            "failed": failed
        }));
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
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

    pub fn reporter(&self, label: &str) -> Box<dyn ProgressSink> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress::new(label)),
            ProgressMode::Json => Box::new(JsonProgress::new(label)),
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
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(123_456), "123,456");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn reporters_accept_every_event() {
        for mode in [ProgressMode::Off, ProgressMode::Human, ProgressMode::Json] {
            let sink = mode.reporter("test");
            sink.started(2);
            sink.advanced(1, 2);
            sink.finished(2, 0);
        }
    }
}
