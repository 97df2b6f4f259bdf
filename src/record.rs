use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::level::Level;

/// Exception payload attached to a record.
///
/// The core only transports it; rendering enhanced tracebacks is the job of
/// an external formatter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    pub name: String,
    pub details: String,
}

/// An immutable, fully-materialized snapshot of a single log event.
///
/// A record is created once per log call and never mutated afterwards: every
/// destination that processes it shares the same read-only copy behind an
/// `Arc`. Records are serializable because destinations configured with a
/// delivery queue may hand them to another process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    level: Level,
    message: String,
    time: DateTime<Utc>,
    elapsed: Duration,
    module: String,
    file: String,
    line: u32,
    process: u32,
    thread_id: u64,
    thread_name: Option<String>,
    exception: Option<Exception>,
    context: Vec<(String, Value)>,
}

impl Record {
    /// Starts building a record with call metadata captured right now.
    pub fn builder<M: Into<String>>(level: Level, message: M) -> RecordBuilder {
        let thread = std::thread::current();

        RecordBuilder {
            record: Record {
                level,
                message: message.into(),
                time: Utc::now(),
                elapsed: runtime_start().elapsed(),
                module: String::new(),
                file: String::new(),
                line: 0,
                process: std::process::id(),
                thread_id: thread_id(),
                thread_name: thread.name().map(str::to_owned),
                exception: None,
                context: Vec::new(),
            },
        }
    }

    pub fn level(&self) -> &Level {
        &self.level
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Time elapsed since the logging runtime was first used in this process.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn process(&self) -> u32 {
        self.process
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    pub fn exception(&self) -> Option<&Exception> {
        self.exception.as_ref()
    }

    /// Key/value context pairs in the order they were attached.
    ///
    /// Duplicates are allowed as a stacking feature.
    pub fn context(&self) -> &[(String, Value)] {
        &self.context
    }
}

/// Builder used by the `log!` macro and the standard logging bridge.
pub struct RecordBuilder {
    record: Record,
}

impl RecordBuilder {
    pub fn module<S: Into<String>>(mut self, module: S) -> RecordBuilder {
        self.record.module = module.into();
        self
    }

    pub fn file<S: Into<String>>(mut self, file: S) -> RecordBuilder {
        self.record.file = file.into();
        self
    }

    pub fn line(mut self, line: u32) -> RecordBuilder {
        self.record.line = line;
        self
    }

    pub fn exception(mut self, exception: Exception) -> RecordBuilder {
        self.record.exception = Some(exception);
        self
    }

    pub fn context<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> RecordBuilder {
        self.record.context.push((key.into(), value.into()));
        self
    }

    pub fn build(self) -> Record {
        self.record
    }
}

/// A formatted message paired with the record it was produced from.
///
/// This is what outputs receive and what crosses the process boundary for
/// queued destinations: sinks like the standard-logging bridge need the
/// original record attributes, and error reports want them too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    text: String,
    record: Arc<Record>,
}

impl Message {
    pub fn new(text: String, record: Arc<Record>) -> Message {
        Message { text, record }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn record(&self) -> &Record {
        &self.record
    }
}

fn runtime_start() -> &'static Instant {
    static START: OnceLock<Instant> = OnceLock::new();

    START.get_or_init(Instant::now)
}

#[cfg(unix)]
#[inline]
fn thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(not(unix))]
#[inline]
fn thread_id() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_captures_call_site() {
        let rec = Record::builder(Level::INFO, "file does not exist: /var/www/favicon.ico")
            .module("app::server")
            .file("server.rs")
            .line(42)
            .build();

        assert_eq!(20, rec.level().no());
        assert_eq!("app::server", rec.module());
        assert_eq!("server.rs", rec.file());
        assert_eq!(42, rec.line());
        assert_eq!(std::process::id(), rec.process());
    }

    #[test]
    fn context_preserves_order_and_duplicates() {
        let rec = Record::builder(Level::INFO, "")
            .context("path", "/home")
            .context("path", "/home/web")
            .context("flag", true)
            .build();

        let keys: Vec<&str> = rec.context().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(vec!["path", "path", "flag"], keys);
    }

    #[test]
    fn record_survives_serialization() {
        let rec = Record::builder(Level::ERROR, "broken pipe")
            .module("app")
            .line(7)
            .context("port", 10053)
            .build();

        let json = serde_json::to_string(&rec).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();

        assert_eq!(rec.message(), back.message());
        assert_eq!(rec.level().no(), back.level().no());
        assert_eq!(rec.line(), back.line());
        assert_eq!(rec.context(), back.context());
    }
}
