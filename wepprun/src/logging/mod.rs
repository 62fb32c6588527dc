//! Per-run logging pipeline.
//!
//! Every controller owns a [`RunLogger`] scoped to its (runid, kind) pair.
//! Records are pushed onto a bounded queue drained by a single listener
//! thread, which writes `<kind>.log` (all records) and
//! `<kind>.exception.log` (errors only) inside the run directory, and
//! mirrors every record to the status channel `<runid>:<kind>` for
//! external subscribers.
//!
//! The single-listener design preserves record ordering within a run and
//! keeps file descriptors out of request threads. Stopping the listener
//! ([`RunLogger::safe_stop_queue_listener`]) is idempotent and also runs
//! on drop, so descriptors are released on normal process termination.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::kv::KvStore;

/// Bound on the record queue; producers drop records when the listener
/// falls this far behind rather than blocking controller threads.
pub const QUEUE_CAPACITY: usize = 1024;

/// Severity of a run log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// One record flowing through the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Run-scoped logger with a queue listener thread.
///
/// Cloning is cheap; all clones feed the same listener.
pub struct RunLogger {
    runid: String,
    kind: String,
    tx: Mutex<Option<SyncSender<LogRecord>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RunLogger {
    /// Starts the listener thread for `(runid, kind)`.
    ///
    /// Log files are appended under `wd`; records additionally publish to
    /// the KV channel `<runid>:<kind>`.
    pub fn start(runid: &str, kind: &str, wd: &Path, kv: Arc<dyn KvStore>) -> Arc<Self> {
        let (tx, rx) = mpsc::sync_channel::<LogRecord>(QUEUE_CAPACITY);
        let log_path = wd.join(format!("{}.log", kind));
        let exception_path = wd.join(format!("{}.exception.log", kind));
        let channel = format!("{}:{}", runid, kind);
        let listener = std::thread::Builder::new()
            .name(format!("runlog-{}-{}", runid, kind))
            .spawn(move || listen(rx, &log_path, &exception_path, &channel, kv))
            .ok();
        Arc::new(Self {
            runid: runid.to_string(),
            kind: kind.to_string(),
            tx: Mutex::new(Some(tx)),
            listener: Mutex::new(listener),
        })
    }

    /// Run this logger belongs to.
    pub fn runid(&self) -> &str {
        &self.runid
    }

    /// Controller kind this logger belongs to.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Enqueues a record. Records sent after the listener stopped, or
    /// while the queue is full, are dropped.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let record = LogRecord {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        };
        let guard = self.tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            match tx.try_send(record) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(runid = %self.runid, kind = %self.kind, "run log queue full, dropping record");
                }
            }
        }
    }

    /// Convenience: INFO record.
    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    /// Convenience: ERROR record (also lands in `<kind>.exception.log`).
    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Stops the queue listener and closes both file handlers.
    ///
    /// Idempotent: repeated calls, or calls after the handlers are gone,
    /// never raise. Pending records are drained before the files close.
    pub fn safe_stop_queue_listener(&self) {
        // Dropping the sender closes the queue; the listener drains and exits.
        drop(self.tx.lock().unwrap().take());
        if let Some(handle) = self.listener.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Whether the listener is still accepting records.
    pub fn is_running(&self) -> bool {
        self.tx.lock().unwrap().is_some()
    }
}

impl Drop for RunLogger {
    fn drop(&mut self) {
        self.safe_stop_queue_listener();
    }
}

fn listen(
    rx: mpsc::Receiver<LogRecord>,
    log_path: &PathBuf,
    exception_path: &PathBuf,
    channel: &str,
    kv: Arc<dyn KvStore>,
) {
    let mut log_file = OpenOptions::new().create(true).append(true).open(log_path).ok();
    let mut exception_file: Option<std::fs::File> = None;
    while let Ok(record) = rx.recv() {
        let line = format!(
            "{} {:7} {}",
            record.timestamp.to_rfc3339(),
            record.level,
            record.message
        );
        if let Some(f) = log_file.as_mut() {
            let _ = writeln!(f, "{}", line);
        }
        if record.level == LogLevel::Error {
            // Exception log is opened lazily on the first error.
            if exception_file.is_none() {
                exception_file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(exception_path)
                    .ok();
            }
            if let Some(f) = exception_file.as_mut() {
                let _ = writeln!(f, "{}", line);
            }
        }
        if let Ok(payload) = serde_json::to_string(&record) {
            kv.publish(channel, &payload);
        }
    }
    // Receiver closed: flush and let the files drop.
    if let Some(f) = log_file.as_mut() {
        let _ = f.flush();
    }
    if let Some(f) = exception_file.as_mut() {
        let _ = f.flush();
    }
}
