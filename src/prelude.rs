//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use ban_lurker::prelude::*;
//! ```

// Core
pub use crate::core::clock::{Clock, ManualClock, SystemClock};
pub use crate::core::config::{Config, LurkerConfig, LurkerParams, TraceConfig};
pub use crate::core::errors::{LurkerError, Result};

// Bans
pub use crate::ban::evaluate::{BanEvaluator, HeaderEvaluator, RequestContext};
pub use crate::ban::list::{BanHold, BanId, BanInfo, BanInfoSink, BanList, CheckOutcome};
pub use crate::ban::spec::{BanField, BanOp, BanSpec, BanTest};
pub use crate::ban::stats::BanStatsSnapshot;

// Objects
pub use crate::store::{Expiry, ExpiryInbox, ObjCore, ObjHead, Rearmed, Xid, deref_objcore};

// Lurker
pub use crate::lurker::LurkerDeps;
pub use crate::lurker::scheduler::{BanLurker, LurkerExit, LurkerHandle, spawn_lurker};

// Trace output
pub use crate::logger::handle::{TraceLoggerHandle, spawn_trace_logger};
pub use crate::logger::trace::{MemorySink, TraceRecord, TraceSink, TraceTag};
