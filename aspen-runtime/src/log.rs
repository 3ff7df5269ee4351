//! Structured Logging
//!
//! Leveled, structured logging for runtime diagnostics. The hot paths of the
//! clone machinery never log; the events that do (context forks, memo
//! rehashes, pool refills) sit on cold paths where a formatted line is cheap
//! relative to the work being reported.
//!
//! # Example
//!
//! ```rust,ignore
//! use aspen_runtime::log::{info, LogBuilder, LogLevel};
//!
//! info("runtime initialized");
//!
//! LogBuilder::new(LogLevel::Debug)
//!     .message("memo rehash")
//!     .field_int("old_capacity", 8)
//!     .field_int("new_capacity", 16)
//!     .field_int("pruned", 2)
//!     .emit();
//! ```

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace = 0,
    /// Debug level.
    Debug = 1,
    /// Info level.
    Info = 2,
    /// Warning level.
    Warn = 3,
    /// Error level.
    Error = 4,
    /// Off (no logging).
    Off = 5,
}

impl LogLevel {
    /// Level name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    /// Level from its `u8` representation.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(LogLevel::Trace),
            1 => Some(LogLevel::Debug),
            2 => Some(LogLevel::Info),
            3 => Some(LogLevel::Warn),
            4 => Some(LogLevel::Error),
            5 => Some(LogLevel::Off),
            _ => None,
        }
    }

    /// Parse a level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "OFF" | "NONE" => Some(LogLevel::Off),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// Output format for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Plain text format (human readable).
    #[default]
    Plain,
    /// JSON format (machine readable).
    Json,
}

impl LogFormat {
    /// Parse a format from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// A value in a structured log entry.
#[derive(Debug, Clone)]
pub enum LogValue {
    /// String value.
    String(String),
    /// Integer value.
    Int(i64),
    /// Boolean value.
    Bool(bool),
}

impl fmt::Display for LogValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogValue::String(s) => write!(f, "{}", s),
            LogValue::Int(i) => write!(f, "{}", i),
            LogValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl LogValue {
    fn to_json(&self) -> String {
        match self {
            LogValue::String(s) => format!("\"{}\"", escape_json(s)),
            LogValue::Int(i) => i.to_string(),
            LogValue::Bool(b) => b.to_string(),
        }
    }
}

/// A log entry with structured fields.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level.
    pub level: LogLevel,
    /// Log message.
    pub message: String,
    /// Structured key-value fields.
    pub fields: Vec<(String, LogValue)>,
    /// Timestamp (Unix milliseconds).
    pub timestamp: u64,
    /// Runtime thread id.
    pub thread: u16,
}

impl LogEntry {
    /// Create a new log entry stamped with the current time and thread.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            level,
            message: message.into(),
            fields: Vec::new(),
            timestamp,
            thread: crate::thread::thread_id(),
        }
    }

    /// Format as plain text.
    pub fn format_plain(&self, timestamps: bool) -> String {
        let mut output = String::new();

        if timestamps {
            let secs = self.timestamp / 1000;
            let millis = self.timestamp % 1000;
            output.push_str(&format!("[{}.{:03}] ", secs, millis));
        }

        output.push_str(&format!("{:<5} (t{}) ", self.level.as_str(), self.thread));
        output.push_str(&self.message);

        if !self.fields.is_empty() {
            output.push_str(" {");
            for (i, (key, value)) in self.fields.iter().enumerate() {
                if i > 0 {
                    output.push_str(", ");
                }
                output.push_str(&format!("{}={}", key, value));
            }
            output.push('}');
        }

        output
    }

    /// Format as JSON.
    pub fn format_json(&self) -> String {
        let mut output = String::from("{");
        output.push_str(&format!("\"timestamp\":{}", self.timestamp));
        output.push_str(&format!(",\"level\":\"{}\"", self.level.as_str()));
        output.push_str(&format!(",\"thread\":{}", self.thread));
        output.push_str(&format!(",\"message\":\"{}\"", escape_json(&self.message)));

        if !self.fields.is_empty() {
            output.push_str(",\"fields\":{");
            for (i, (key, value)) in self.fields.iter().enumerate() {
                if i > 0 {
                    output.push(',');
                }
                output.push_str(&format!("\"{}\":{}", escape_json(key), value.to_json()));
            }
            output.push('}');
        }

        output.push('}');
        output
    }
}

/// Escape a string for JSON output.
fn escape_json(s: &str) -> String {
    let mut output = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if c.is_control() => output.push_str(&format!("\\u{:04x}", c as u32)),
            c => output.push(c),
        }
    }
    output
}

/// Minimum level, atomic for the fast would-log check.
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Whether logging is enabled at all.
static ENABLED: AtomicBool = AtomicBool::new(true);

/// Sink configuration behind a lock; only touched when actually emitting.
static SINK: Mutex<SinkConfig> = Mutex::new(SinkConfig {
    format: LogFormat::Plain,
    timestamps: true,
});

struct SinkConfig {
    format: LogFormat,
    timestamps: bool,
}

/// Set the minimum log level.
pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// The current minimum log level.
pub fn level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::SeqCst)).unwrap_or(LogLevel::Info)
}

/// Set the output format.
pub fn set_format(format: LogFormat) {
    SINK.lock().format = format;
}

/// Enable or disable timestamps in plain output.
pub fn set_timestamps(enabled: bool) {
    SINK.lock().timestamps = enabled;
}

/// Enable or disable logging.
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::SeqCst);
}

/// Would a message at `level` be emitted?
pub fn would_log(level: LogLevel) -> bool {
    ENABLED.load(Ordering::SeqCst) && level >= self::level()
}

/// Emit a log entry to stderr.
pub fn emit(entry: &LogEntry) {
    if !would_log(entry.level) {
        return;
    }
    let output = {
        let sink = SINK.lock();
        match sink.format {
            LogFormat::Plain => entry.format_plain(sink.timestamps),
            LogFormat::Json => entry.format_json(),
        }
    };
    let _ = writeln!(std::io::stderr(), "{}", output);
}

/// Builder for structured log entries.
#[derive(Debug)]
pub struct LogBuilder {
    entry: LogEntry,
}

impl LogBuilder {
    /// Create a new log builder.
    pub fn new(level: LogLevel) -> Self {
        Self {
            entry: LogEntry::new(level, ""),
        }
    }

    /// Set the message.
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.entry.message = msg.into();
        self
    }

    /// Add a string field.
    pub fn field_str(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entry
            .fields
            .push((key.into(), LogValue::String(value.into())));
        self
    }

    /// Add an integer field.
    pub fn field_int(mut self, key: impl Into<String>, value: i64) -> Self {
        self.entry.fields.push((key.into(), LogValue::Int(value)));
        self
    }

    /// Add a boolean field.
    pub fn field_bool(mut self, key: impl Into<String>, value: bool) -> Self {
        self.entry.fields.push((key.into(), LogValue::Bool(value)));
        self
    }

    /// Emit the entry.
    pub fn emit(self) {
        emit(&self.entry);
    }
}

/// Log a message at the given level.
pub fn log(level: LogLevel, message: impl Into<String>) {
    if !would_log(level) {
        return;
    }
    emit(&LogEntry::new(level, message));
}

/// Log a trace message.
pub fn trace(message: impl Into<String>) {
    log(LogLevel::Trace, message);
}

/// Log a debug message.
pub fn debug(message: impl Into<String>) {
    log(LogLevel::Debug, message);
}

/// Log an info message.
pub fn info(message: impl Into<String>) {
    log(LogLevel::Info, message);
}

/// Log a warning message.
pub fn warn(message: impl Into<String>) {
    log(LogLevel::Warn, message);
}

/// Log an error message.
pub fn error(message: impl Into<String>) {
    log(LogLevel::Error, message);
}
