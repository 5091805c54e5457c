// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logger handle and output sinks

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use super::{Facility, Severity};

/// A single log record handed to a sink
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub severity: Severity,
    pub facility: Facility,
    pub interface: Option<String>,
    pub message: String,
}

/// Output sink abstraction so tests can capture log output
pub trait LogSink: Send + Sync {
    fn write(&self, entry: &LogEntry);
}

/// JSON-per-line sink writing to stderr
pub struct StderrJsonSink;

impl LogSink for StderrJsonSink {
    fn write(&self, entry: &LogEntry) {
        let record = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "level": entry.severity.as_str(),
            "facility": entry.facility.as_str(),
            "interface": entry.interface,
            "message": entry.message,
        });
        eprintln!("{}", record);
    }
}

/// Sink that collects entries in memory, used by unit tests
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl LogSink for MemorySink {
    fn write(&self, entry: &LogEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}

/// Logger handle for writing log entries
///
/// This is a lightweight handle that can be cloned and passed around.
/// The sink and the minimum level are shared.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    min_level: Arc<AtomicU8>,
    /// Interface name stamped on every entry from this handle, if any
    interface: Option<String>,
}

impl Logger {
    /// Create a logger that writes JSON lines to stderr
    pub fn stderr_json(min_level: Severity) -> Self {
        Self::with_sink(Arc::new(StderrJsonSink), min_level)
    }

    /// Create a logger over an explicit sink
    pub fn with_sink(sink: Arc<dyn LogSink>, min_level: Severity) -> Self {
        Self {
            sink,
            min_level: Arc::new(AtomicU8::new(min_level.as_u8())),
            interface: None,
        }
    }

    /// Derive a handle that stamps entries with an interface name
    pub fn for_interface(&self, interface: &str) -> Self {
        let mut logger = self.clone();
        logger.interface = Some(interface.to_string());
        logger
    }

    pub fn set_min_level(&self, level: Severity) {
        self.min_level.store(level.as_u8(), Ordering::Relaxed);
    }

    #[inline]
    fn should_log(&self, severity: Severity) -> bool {
        severity.as_u8() <= self.min_level.load(Ordering::Relaxed)
    }

    pub fn log(&self, severity: Severity, facility: Facility, message: &str) {
        if !self.should_log(severity) {
            return;
        }
        self.sink.write(&LogEntry {
            severity,
            facility,
            interface: self.interface.clone(),
            message: message.to_string(),
        });
    }

    pub fn critical(&self, facility: Facility, message: &str) {
        self.log(Severity::Critical, facility, message);
    }

    pub fn error(&self, facility: Facility, message: &str) {
        self.log(Severity::Error, facility, message);
    }

    pub fn warning(&self, facility: Facility, message: &str) {
        self.log(Severity::Warning, facility, message);
    }

    pub fn notice(&self, facility: Facility, message: &str) {
        self.log(Severity::Notice, facility, message);
    }

    pub fn info(&self, facility: Facility, message: &str) {
        self.log(Severity::Info, facility, message);
    }

    pub fn debug(&self, facility: Facility, message: &str) {
        self.log(Severity::Debug, facility, message);
    }
}
