//! Trace logger thread.
//!
//! A dedicated thread owns the [`JsonlWriter`]. Everyone else holds a
//! [`TraceLoggerHandle`] and submits batches over a bounded crossbeam channel
//! with `try_send`, so a slow disk can never stall the lurker. Batches that do
//! not fit are dropped and counted; the thread reports the loss in-band.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::core::config::TraceConfig;
use crate::core::errors::{LurkerError, Result};
use crate::logger::jsonl::{JsonlConfig, JsonlWriter, WriterState};
use crate::logger::trace::{Severity, TraceRecord, TraceSink, TraceTag};

/// How often a degraded writer retries its primary path.
const RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

enum Msg {
    Batch(Vec<TraceRecord>),
    Shutdown,
}

/// Cloneable sender side of the trace logger.
#[derive(Clone)]
pub struct TraceLoggerHandle {
    tx: Sender<Msg>,
    dropped_records: Arc<AtomicU64>,
}

impl std::fmt::Debug for TraceLoggerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceLoggerHandle")
            .field("dropped_records", &self.dropped_records())
            .finish_non_exhaustive()
    }
}

impl TraceLoggerHandle {
    /// Records lost to back-pressure and not yet reported.
    #[must_use]
    pub fn dropped_records(&self) -> u64 {
        self.dropped_records.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Msg::Shutdown);
    }
}

impl TraceSink for TraceLoggerHandle {
    fn submit(&self, batch: Vec<TraceRecord>) {
        let n = batch.len() as u64;
        if let Err(TrySendError::Full(_)) = self.tx.try_send(Msg::Batch(batch)) {
            self.dropped_records.fetch_add(n, Ordering::Relaxed);
        }
        // Disconnected only happens during shutdown.
    }
}

/// Spawn the `trace-logger` thread.
pub fn spawn_trace_logger(
    config: &TraceConfig,
) -> Result<(TraceLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<Msg>(config.channel_capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = TraceLoggerHandle {
        tx,
        dropped_records: Arc::clone(&dropped),
    };
    let jsonl = JsonlConfig::from(config);

    let join = thread::Builder::new()
        .name("trace-logger".to_string())
        .spawn(move || logger_main(&rx, jsonl, &dropped))
        .map_err(|e| LurkerError::Runtime {
            details: format!("failed to spawn trace logger thread: {e}"),
        })?;

    Ok((handle, join))
}

fn logger_main(rx: &Receiver<Msg>, config: JsonlConfig, dropped: &AtomicU64) {
    let mut jsonl = JsonlWriter::open(config);

    loop {
        let msg = match rx.recv_timeout(RECOVERY_INTERVAL) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => {
                if jsonl.state() != WriterState::Primary {
                    jsonl.try_recover();
                }
                jsonl.flush();
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            jsonl.write_record(&TraceRecord::new(
                Severity::Warning,
                TraceTag::Backpressure,
                format!("{lost} trace records dropped due to back-pressure"),
            ));
        }

        match msg {
            Msg::Batch(batch) => {
                for record in &batch {
                    jsonl.write_record(record);
                }
            }
            Msg::Shutdown => break,
        }
    }

    jsonl.fsync();
}
