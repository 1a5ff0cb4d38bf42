//! Trace records and sinks.
//!
//! The lurker writes into a private [`TraceBuffer`] and hands whole batches to a
//! [`TraceSink`] on flush, so the hot loop never touches shared log state per
//! record. Flushes happen before every backoff sleep and at the end of each cycle.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::store::Xid;

/// Record severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Lurker progress detail.
    Debug,
    /// Normal events.
    Info,
    /// Lost output and other degradations.
    Warning,
}

/// What a record is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceTag {
    /// An object was evicted by a ban.
    ExpBan,
    /// Lurker progress, only emitted in debug mode.
    Debug,
    /// A ban was removed from the list tail.
    BanDrop,
    /// The lurker thread entered its loop.
    LurkerStart,
    /// The lurker thread left its loop.
    LurkerStop,
    /// Records were lost to logger back-pressure.
    Backpressure,
}

/// One structured trace line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// RFC 3339 UTC timestamp.
    pub ts: String,
    /// Severity.
    pub level: Severity,
    /// Event kind.
    pub tag: TraceTag,
    /// Object the record concerns, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xid: Option<Xid>,
    /// Human-readable text.
    pub message: String,
}

impl TraceRecord {
    /// Create a record stamped with the current UTC time.
    pub fn new(level: Severity, tag: TraceTag, message: impl Into<String>) -> Self {
        Self {
            ts: format_utc_now(),
            level,
            tag,
            xid: None,
            message: message.into(),
        }
    }

    /// Attach the object the record concerns.
    #[must_use]
    pub fn with_xid(mut self, xid: Xid) -> Self {
        self.xid = Some(xid);
        self
    }
}

/// Destination for flushed trace batches.
pub trait TraceSink: Send + Sync + fmt::Debug {
    /// Take ownership of one flushed batch. Must not block for long.
    fn submit(&self, batch: Vec<TraceRecord>);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TraceSink for NullSink {
    fn submit(&self, _batch: Vec<TraceRecord>) {}
}

/// Keeps every record in memory. Used by tests and the soak report.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<TraceRecord>>,
}

impl MemorySink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything received so far.
    #[must_use]
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().clone()
    }

    /// Messages of every record carrying `tag`, in arrival order.
    #[must_use]
    pub fn messages(&self, tag: TraceTag) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.tag == tag)
            .map(|r| r.message.clone())
            .collect()
    }

    /// Number of records carrying `tag`.
    #[must_use]
    pub fn count(&self, tag: TraceTag) -> usize {
        self.records.lock().iter().filter(|r| r.tag == tag).count()
    }
}

impl TraceSink for MemorySink {
    fn submit(&self, batch: Vec<TraceRecord>) {
        self.records.lock().extend(batch);
    }
}

/// Per-thread buffered trace output.
pub struct TraceBuffer {
    sink: Arc<dyn TraceSink>,
    pending: Vec<TraceRecord>,
    debug: bool,
}

impl TraceBuffer {
    /// Empty buffer with debug records off.
    #[must_use]
    pub fn new(sink: Arc<dyn TraceSink>) -> Self {
        Self {
            sink,
            pending: Vec::new(),
            debug: false,
        }
    }

    /// Toggle debug records; re-read from live params every cycle.
    pub fn set_debug(&mut self, on: bool) {
        self.debug = on;
    }

    /// Whether debug records are currently kept.
    #[must_use]
    pub fn debug_enabled(&self) -> bool {
        self.debug
    }

    /// Buffer a record until the next flush.
    pub fn push(&mut self, record: TraceRecord) {
        self.pending.push(record);
    }

    /// Buffer an info record.
    pub fn info(&mut self, tag: TraceTag, message: impl Into<String>) {
        self.push(TraceRecord::new(Severity::Info, tag, message));
    }

    /// Debug record, dropped unless debug mode is on.
    pub fn debug(&mut self, message: impl FnOnce() -> String) {
        if self.debug {
            self.push(TraceRecord::new(Severity::Debug, TraceTag::Debug, message()));
        }
    }

    /// Records buffered since the last flush.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Hand buffered records to the sink.
    pub fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.sink.submit(std::mem::take(&mut self.pending));
        }
    }
}

impl fmt::Debug for TraceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceBuffer")
            .field("pending", &self.pending.len())
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

impl Drop for TraceBuffer {
    fn drop(&mut self) {
        self.flush();
    }
}

pub(crate) fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_holds_until_flush() {
        let sink = Arc::new(MemorySink::new());
        let mut buf = TraceBuffer::new(sink.clone());
        buf.info(TraceTag::ExpBan, "7 banned by lurker");
        assert_eq!(buf.pending(), 1);
        assert!(sink.records().is_empty());
        buf.flush();
        assert_eq!(buf.pending(), 0);
        assert_eq!(sink.messages(TraceTag::ExpBan), vec!["7 banned by lurker"]);
    }

    #[test]
    fn debug_records_gated() {
        let sink = Arc::new(MemorySink::new());
        let mut buf = TraceBuffer::new(sink.clone());
        buf.debug(|| "hidden".to_string());
        buf.set_debug(true);
        buf.debug(|| "shown".to_string());
        drop(buf);
        assert_eq!(sink.messages(TraceTag::Debug), vec!["shown"]);
    }

    #[test]
    fn record_serializes_without_absent_xid() {
        let rec = TraceRecord::new(Severity::Info, TraceTag::BanDrop, "dropped");
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"tag\":\"ban_drop\""));
        assert!(json.contains("\"level\":\"info\""));
        assert!(!json.contains("xid"));
        let with = serde_json::to_string(&rec.with_xid(42)).unwrap();
        assert!(with.contains("\"xid\":42"));
    }
}
