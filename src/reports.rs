//! Progress and diagnostic reporting.
//!
//! The engine never prints directly; it calls through a `Reports`
//! implementation so callers (a library embedder, a test harness) can
//! redirect, collect, or silence output. The default implementation prints to
//! stdout/stderr the same way the rest of this crate's ancestry does
//! (`println!`/`eprintln!`), rather than pulling in a structured logging
//! framework the rest of the stack doesn't use.

use std::io::Write;

/// Severity-leveled + structured-data reporting sink used throughout the
/// transfer, keyring, and workflow layers.
pub trait Reports {
    fn debug(&self, msg: &str);
    fn info(&self, msg: &str);
    fn warning(&self, msg: &str);
    fn error(&self, msg: &str);
    fn important(&self, msg: &str);

    /// A labeled, machine-relevant data point (bytes transferred, mirror
    /// chosen, checksum verified) distinct from free-form prose messages.
    fn data(&self, label: &str, value: &str);
}

/// Default sink: stdout for info/important/data, stderr for warning/error,
/// debug only when `REPO_PROVISION_DEBUG` is set in the environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleReports;

impl Reports for ConsoleReports {
    fn debug(&self, msg: &str) {
        if std::env::var_os("REPO_PROVISION_DEBUG").is_some() {
            eprintln!("debug: {msg}");
        }
    }

    fn info(&self, msg: &str) {
        println!("{msg}");
    }

    fn warning(&self, msg: &str) {
        eprintln!("warning: {msg}");
        let _ = std::io::stderr().flush();
    }

    fn error(&self, msg: &str) {
        eprintln!("error: {msg}");
        let _ = std::io::stderr().flush();
    }

    fn important(&self, msg: &str) {
        println!("==> {msg}");
    }

    fn data(&self, label: &str, value: &str) {
        println!("{label}: {value}");
    }
}

/// In-memory sink for tests: records every call in order instead of writing
/// to the console.
#[derive(Debug, Default)]
pub struct RecordingReports {
    pub lines: std::sync::Mutex<Vec<String>>,
}

impl RecordingReports {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, line: String) {
        self.lines.lock().unwrap().push(line);
    }
}

impl Reports for RecordingReports {
    fn debug(&self, msg: &str) {
        self.push(format!("debug: {msg}"));
    }

    fn info(&self, msg: &str) {
        self.push(format!("info: {msg}"));
    }

    fn warning(&self, msg: &str) {
        self.push(format!("warning: {msg}"));
    }

    fn error(&self, msg: &str) {
        self.push(format!("error: {msg}"));
    }

    fn important(&self, msg: &str) {
        self.push(format!("important: {msg}"));
    }

    fn data(&self, label: &str, value: &str) {
        self.push(format!("data: {label}={value}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_reports_preserves_order() {
        let reports = RecordingReports::new();
        reports.info("starting");
        reports.data("bytes", "1024");
        reports.warning("retry 1/3");
        let lines = reports.lines.lock().unwrap();
        assert_eq!(
            *lines,
            vec![
                "info: starting".to_string(),
                "data: bytes=1024".to_string(),
                "warning: retry 1/3".to_string(),
            ]
        );
    }
}
