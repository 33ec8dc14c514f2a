//! Log sink for child-process output.
//!
//! Both the shell channel and the supervised server push every raw output line
//! here:
//! - ring buffer of recent lines with sequential IDs (`get_since` polling)
//! - real-time broadcast via `subscribe()`
//! - optional regex-based severity parsing

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default maximum number of log lines to keep in the ring buffer.
const DEFAULT_LOG_BUFFER: usize = 10_000;

const BROADCAST_CAPACITY: usize = 2048;

// ─── Log Types ───────────────────────────────────────────────

/// A single line of output from a child process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Sequential ID for polling
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: LogSource,
    /// Raw text content, escape sequences included
    pub content: String,
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Messages from the keeper itself (spawn, exit, ...)
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

// ─── Log Buffer ──────────────────────────────────────────────

struct LogBuffer {
    lines: VecDeque<LogLine>,
    next_id: u64,
    max_size: usize,
}

impl LogBuffer {
    fn with_capacity(max_size: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_size.min(1024)),
            next_id: 0,
            max_size: max_size.max(1),
        }
    }

    fn push(&mut self, source: LogSource, content: String, level: LogLevel) -> LogLine {
        let line = LogLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            content,
            level,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    fn get_since(&self, since_id: u64) -> Vec<LogLine> {
        self.lines.iter().filter(|l| l.id > since_id).cloned().collect()
    }

    fn get_recent(&self, count: usize) -> Vec<LogLine> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }
}

// ─── Log Sink ────────────────────────────────────────────────

/// Cloneable handle; every clone writes into the same buffer and broadcast.
#[derive(Clone)]
pub struct LogSink {
    buffer: Arc<Mutex<LogBuffer>>,
    broadcast: broadcast::Sender<LogLine>,
    level_pattern: Option<Arc<Regex>>,
}

impl Default for LogSink {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_BUFFER)
    }
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_lines: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            buffer: Arc::new(Mutex::new(LogBuffer::with_capacity(max_lines))),
            broadcast: tx,
            level_pattern: None,
        }
    }

    /// Use a regex with a named `level` group to classify lines.
    /// An invalid pattern is logged and ignored; every line then defaults to Info.
    pub fn with_level_pattern(mut self, pattern: &str) -> Self {
        self.level_pattern = match Regex::new(pattern) {
            Ok(re) => Some(Arc::new(re)),
            Err(e) => {
                tracing::warn!("Invalid log level pattern '{}': {}, falling back to default", pattern, e);
                None
            }
        };
        self
    }

    fn lock(&self) -> MutexGuard<'_, LogBuffer> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record one line of child output.
    pub fn push(&self, source: LogSource, content: impl Into<String>) -> LogLine {
        let content = content.into();
        let level = parse_log_level(&content, self.level_pattern.as_deref());
        // stderr lines default to at least Warn
        let level = if source == LogSource::Stderr && level == LogLevel::Info {
            LogLevel::Warn
        } else {
            level
        };
        let line = self.lock().push(source, content, level);
        let _ = self.broadcast.send(line.clone());
        line
    }

    /// Record a message produced by the keeper itself.
    pub fn system(&self, message: impl Into<String>) -> LogLine {
        let line = self.lock().push(LogSource::System, message.into(), LogLevel::Info);
        let _ = self.broadcast.send(line.clone());
        line
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.broadcast.subscribe()
    }

    /// All buffered lines with `id > since_id`.
    pub fn get_since(&self, since_id: u64) -> Vec<LogLine> {
        self.lock().get_since(since_id)
    }

    /// The most recent `count` lines, oldest first.
    pub fn get_recent(&self, count: usize) -> Vec<LogLine> {
        self.lock().get_recent(count)
    }
}

// ─── Helpers ─────────────────────────────────────────────────

/// Parse the severity of a line using an optional regex with a `level` group.
/// Without a pattern (or without a match) the line is Info.
///
/// Example pattern for the bundled server's logging format:
///   `(?P<level>DEBUG|INFO|WARNING|ERROR|CRITICAL)`
fn parse_log_level(line: &str, pattern: Option<&Regex>) -> LogLevel {
    let Some(re) = pattern else {
        return LogLevel::Info;
    };
    match re.captures(line).and_then(|caps| caps.name("level")) {
        Some(level) => match level.as_str().to_uppercase().as_str() {
            "ERROR" | "FATAL" | "CRITICAL" => LogLevel::Error,
            "WARN" | "WARNING" => LogLevel::Warn,
            "DEBUG" | "TRACE" => LogLevel::Debug,
            _ => LogLevel::Info,
        },
        None => LogLevel::Info,
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
