//! Testing a ban's queued objects against the actionable bans.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::ban::record::Ban;
use crate::ban::list::BanId;
use crate::core::config::ParamSnapshot;
use crate::logger::trace::{Severity, TraceBuffer, TraceRecord, TraceTag};
use crate::lurker::LurkerDeps;
use crate::lurker::acquire::{Acquired, ObjectAcquirer};
use crate::store::{ObjCore, deref_objcore};

/// A ban selected for lazy testing in the current pass.
#[derive(Debug, Clone)]
pub struct ActionableBan {
    /// List handle.
    pub id: BanId,
    /// Shared record, for lock-free evaluation.
    pub ban: Arc<Ban>,
}

/// Cooperative self-throttle: pause after every `limit` objects.
///
/// The count lives with the lurker thread and carries over between queues
/// and passes.
#[derive(Debug, Default)]
pub struct BatchLimiter {
    processed: u32,
    pauses: u64,
}

impl BatchLimiter {
    /// Fresh count, no pauses taken.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one object. Once the count passes `limit`, sleep for `pause`
    /// and start over. Returns true when it paused.
    pub fn tick(&mut self, limit: u32, pause: Duration) -> bool {
        self.processed = self.processed.saturating_add(1);
        if self.processed <= limit {
            return false;
        }
        thread::sleep(pause);
        self.processed = 0;
        self.pauses += 1;
        true
    }

    /// Pauses taken so far.
    #[must_use]
    pub fn pauses(&self) -> u64 {
        self.pauses
    }
}

/// How a queue drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEnd {
    /// Nothing was queued; no marker was placed.
    Empty,
    /// The marker came back around.
    Drained,
    /// Every actionable ban was superseded mid-drain.
    SetEmptied,
    /// Acquisition gave up under contention.
    Aborted,
}

/// Result of draining one ban's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestOutcome {
    /// Why the drain stopped.
    pub end: QueueEnd,
    /// Objects acquired and tested.
    pub objects: u64,
    /// Objects that matched and were rearmed.
    pub killed: u64,
}

/// Runs queued objects of one ban through the actionable set.
#[derive(Debug)]
pub struct BanTester<'a> {
    deps: &'a LurkerDeps,
    acquirer: ObjectAcquirer<'a>,
    batch: u32,
    pause: Duration,
}

impl<'a> BanTester<'a> {
    /// Tester using `params`' batch size, pause and backoff.
    #[must_use]
    pub fn new(deps: &'a LurkerDeps, params: &ParamSnapshot) -> Self {
        Self {
            deps,
            acquirer: ObjectAcquirer::new(&deps.bans, params),
            batch: params.batch,
            pause: params.batch_pause(),
        }
    }

    /// Test one referenced object. `actionable` is newest-first; bans found
    /// COMPLETED are dropped from it first, the rest are tried oldest-first.
    /// Returns true if the object was banned.
    pub fn test_object(
        &self,
        oc: &Arc<ObjCore>,
        actionable: &mut Vec<ActionableBan>,
        trace: &mut TraceBuffer,
    ) -> bool {
        let stats = self.deps.bans.stats();
        // Overtaken by a newer duplicate.
        actionable.retain(|a| !a.ban.is_completed());

        let hit = actionable.iter().rev().any(|a| {
            let ev = self.deps.evaluator.evaluate(a.ban.spec(), oc, None);
            stats.lurker_tested(u64::from(ev.tests));
            ev.matched
        });
        if hit {
            let xid = oc.xid();
            trace.push(
                TraceRecord::new(
                    Severity::Info,
                    TraceTag::ExpBan,
                    format!("{xid} banned by lurker"),
                )
                .with_xid(xid),
            );
            self.deps.expiry.rearm(oc, self.deps.clock.now());
            stats.lurker_killed();
        }
        hit
    }

    /// Drain `bt`'s queue up to a freshly placed end-of-pass marker.
    pub fn test_ban(
        &self,
        bt: BanId,
        actionable: &mut Vec<ActionableBan>,
        limiter: &mut BatchLimiter,
        trace: &mut TraceBuffer,
    ) -> TestOutcome {
        let mut outcome = TestOutcome {
            end: QueueEnd::Empty,
            objects: 0,
            killed: 0,
        };
        {
            let mut st = self.deps.bans.lock();
            if st.queue_is_empty(bt) {
                return outcome;
            }
            st.push_marker(bt);
        }

        loop {
            limiter.tick(self.batch, self.pause);
            let oc = match self.acquirer.acquire(bt, trace) {
                Acquired::Object(oc) => oc,
                Acquired::Exhausted => {
                    outcome.end = QueueEnd::Drained;
                    return outcome;
                }
                Acquired::GaveUp => {
                    outcome.end = QueueEnd::Aborted;
                    return outcome;
                }
            };
            outcome.objects += 1;
            if self.test_object(&oc, actionable, trace) {
                outcome.killed += 1;
            }
            deref_objcore(&self.deps.bans, &oc);

            if actionable.is_empty() {
                self.deps.bans.lock().discard_marker(bt);
                outcome.end = QueueEnd::SetEmptied;
                return outcome;
            }
        }
    }
}
