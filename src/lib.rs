#![forbid(unsafe_code)]

//! Ban lurker: background evaluation of bans against cached objects.
//!
//! A ban is a predicate over cached objects. New bans go on the head of the
//! [`ban::list::BanList`]; every resident object sits on the queue of the
//! newest ban it has been checked against. Objects are checked lazily on
//! lookup, and the lurker thread walks the queues in the background so bans
//! can be retired and unpopular objects do not pin old bans forever.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use ban_lurker::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use ban_lurker::core::config::Config;
//! use ban_lurker::lurker::scheduler::spawn_lurker;
//! ```

pub mod prelude;

pub mod ban;
pub mod core;
#[cfg(feature = "daemon")]
pub mod daemon;
pub mod logger;
pub mod lurker;
pub mod store;
