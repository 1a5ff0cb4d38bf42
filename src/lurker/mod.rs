//! The ban lurker: background application of bans to resident objects and
//! garbage collection of bans nobody needs any more.
//!
//! [`scheduler`] drives the loop. Each cycle runs one [`planner`] pass, which
//! feeds objects from [`acquire`] through [`tester`], and then a [`reaper`]
//! sweep of the list tail.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::ban::evaluate::BanEvaluator;
use crate::ban::list::BanList;
use crate::core::clock::Clock;
use crate::store::ExpiryInbox;

pub mod acquire;
pub mod planner;
pub mod reaper;
pub mod scheduler;
pub mod tester;

/// Wait used when the lurker is disabled or had nothing to do.
pub const IDLE_INTERVAL: Duration = Duration::from_millis(609);

/// Everything the lurker works against.
#[derive(Clone)]
pub struct LurkerDeps {
    /// The shared ban list.
    pub bans: Arc<BanList>,
    /// Predicate evaluation.
    pub evaluator: Arc<dyn BanEvaluator>,
    /// Where banned objects are sent.
    pub expiry: ExpiryInbox,
    /// Source of ban ages and rearm times.
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for LurkerDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LurkerDeps")
            .field("bans", &self.bans)
            .field("evaluator", &self.evaluator)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
