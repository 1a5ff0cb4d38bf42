//! Structured trace output: per-thread buffers, sinks, and the JSONL logger thread.

pub mod handle;
pub mod jsonl;
pub mod trace;
