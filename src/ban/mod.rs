//! Ban list data model: predicates, flags, per-ban object queues, the shared
//! list itself, and the counters kept about it.

pub mod evaluate;
pub mod list;
pub mod queue;
pub mod record;
pub mod spec;
pub mod stats;
