//! Crawl progress reporting.
//!
//! Reports observable progress during `ecfr sync` and `ecfr retry-failed`
//! so users see which page is being fetched and how much is left. Progress
//! is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// Counting results before the first page.
    Counting { agency: String },
    /// A page finished: `page` of `total_pages` (1-based for display).
    Page {
        agency: String,
        page: u32,
        total_pages: u32,
        descriptors: u64,
    },
    /// Retry pass: `n` failed descriptors handled out of `total`.
    Retrying { agency: String, n: u64, total: u64 },
}

/// Reports crawl progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync epa  page 3 / 12  (60 results)".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Counting { agency } => format!("sync {}  counting...\n", agency),
            SyncProgressEvent::Page {
                agency,
                page,
                total_pages,
                descriptors,
            } => format!(
                "sync {}  page {} / {}  ({} results)\n",
                agency,
                format_number(u64::from(*page)),
                format_number(u64::from(*total_pages)),
                format_number(*descriptors)
            ),
            SyncProgressEvent::Retrying { agency, n, total } => format!(
                "retry {}  {} / {} failed items\n",
                agency,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Counting { agency } => serde_json::json!({
                "event": "progress",
                "agency": agency,
                "phase": "counting"
            }),
            SyncProgressEvent::Page {
                agency,
                page,
                total_pages,
                descriptors,
            } => serde_json::json!({
                "event": "progress",
                "agency": agency,
                "phase": "page",
                "page": page,
                "total_pages": total_pages,
                "descriptors": descriptors
            }),
            SyncProgressEvent::Retrying { agency, n, total } => serde_json::json!({
                "event": "progress",
                "agency": agency,
                "phase": "retrying",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
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

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
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
}
