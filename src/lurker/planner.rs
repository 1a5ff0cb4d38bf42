//! One lurker pass.
//!
//! Pick the actionable bans, then walk the whole list oldest-first. Each ban's
//! queue is drained against the actionable set; when the walk reaches the
//! oldest actionable ban, every object that could still match it has already
//! been tested, so it is marked COMPLETED and leaves the set.

use std::time::SystemTime;

use crate::core::config::ParamSnapshot;
use crate::logger::trace::TraceBuffer;
use crate::lurker::LurkerDeps;
use crate::lurker::tester::{ActionableBan, BanTester, BatchLimiter, QueueEnd};

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// No ban was actionable.
    NoWork,
    /// Every actionable ban was reached.
    Done {
        /// Bans marked COMPLETED.
        completed: usize,
        /// Objects rearmed.
        killed: u64,
    },
    /// Acquisition gave up; no further bans were completed.
    Aborted {
        /// Bans marked COMPLETED before giving up.
        completed: usize,
        /// Objects rearmed before giving up.
        killed: u64,
    },
}

impl PassOutcome {
    /// False only for [`PassOutcome::NoWork`].
    #[must_use]
    pub const fn did_work(self) -> bool {
        !matches!(self, Self::NoWork)
    }
}

/// Plans and runs one pass over the ban list.
#[derive(Debug)]
pub struct PassPlanner<'a> {
    deps: &'a LurkerDeps,
    params: ParamSnapshot,
}

impl<'a> PassPlanner<'a> {
    /// Planner bound to one parameter snapshot.
    #[must_use]
    pub fn new(deps: &'a LurkerDeps, params: ParamSnapshot) -> Self {
        Self { deps, params }
    }

    /// Bans worth testing lazily, newest-first: not completed, no request
    /// scope, not the list tail, and at least `age_secs` old.
    #[must_use]
    pub fn actionable(&self, now: SystemTime) -> Vec<ActionableBan> {
        let min_age = self.params.min_age();
        let st = self.deps.bans.lock();
        let tail = st.oldest();
        let mut out = Vec::new();
        let mut cursor = Some(st.newest());
        while let Some(id) = cursor {
            let ban = &st.slot(id).ban;
            if !ban.is_completed()
                && !ban.has_request_scope()
                && id != tail
                && ban.age(now) >= min_age
            {
                out.push(ActionableBan {
                    id,
                    ban: std::sync::Arc::clone(ban),
                });
            }
            cursor = st.older(id);
        }
        out
    }

    /// Run one pass: drain every queue oldest-first, completing bans as the walk reaches them.
    pub fn run(&self, limiter: &mut BatchLimiter, trace: &mut TraceBuffer) -> PassOutcome {
        let bans = &self.deps.bans;
        let mut actionable = self.actionable(self.deps.clock.now());
        let count = actionable.len();
        trace.debug(|| format!("lurker: {count} actionable bans"));
        if actionable.is_empty() {
            return PassOutcome::NoWork;
        }
        bans.stats().lurker_pass();

        let tester = BanTester::new(self.deps, &self.params);
        let mut completed = 0;
        let mut killed = 0;
        let mut cursor = Some(bans.oldest());
        while let Some(bt) = cursor {
            if actionable.last().is_some_and(|a| a.id == bt) {
                trace.debug(|| format!("Lurk bt completed {bt}"));
                {
                    let st = bans.lock();
                    // A newer duplicate may have completed it already.
                    if bans.mark_completed_locked(&st, bt) {
                        completed += 1;
                    }
                }
                actionable.pop();
                if actionable.is_empty() {
                    break;
                }
            }
            trace.debug(|| format!("Lurk bt {bt}"));
            let out = tester.test_ban(bt, &mut actionable, limiter, trace);
            killed += out.killed;
            if out.end == QueueEnd::Aborted {
                return PassOutcome::Aborted { completed, killed };
            }
            if actionable.is_empty() {
                break;
            }
            cursor = bans.lock().newer(bt);
        }
        PassOutcome::Done { completed, killed }
    }
}
