//! Ban and lurker counters.
//!
//! The aggregate ban counters (`bans`, `bans_completed`, `bans_obj`,
//! `bans_req`) only change while the ban lock is held, so they always agree
//! with the list. The lurker counters are plain relaxed increments.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::ban::record::BanFlags;

/// Live counters.
#[derive(Debug, Default)]
pub struct BanStats {
    bans: AtomicU64,
    bans_added: AtomicU64,
    bans_deleted: AtomicU64,
    bans_completed: AtomicU64,
    bans_obj: AtomicU64,
    bans_req: AtomicU64,
    bans_dups: AtomicU64,
    bans_persisted_fragmentation: AtomicU64,
    bans_lurker_tested: AtomicU64,
    bans_lurker_tests_tested: AtomicU64,
    bans_lurker_obj_killed: AtomicU64,
    bans_lurker_contention: AtomicU64,
    bans_lurker_passes: AtomicU64,
    bans_lurker_aborted: AtomicU64,
}

/// Point-in-time copy of [`BanStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanStatsSnapshot {
    pub bans: u64,
    pub bans_added: u64,
    pub bans_deleted: u64,
    pub bans_completed: u64,
    pub bans_obj: u64,
    pub bans_req: u64,
    pub bans_dups: u64,
    pub bans_persisted_fragmentation: u64,
    pub bans_lurker_tested: u64,
    pub bans_lurker_tests_tested: u64,
    pub bans_lurker_obj_killed: u64,
    pub bans_lurker_contention: u64,
    pub bans_lurker_passes: u64,
    pub bans_lurker_aborted: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

fn drop_one(counter: &AtomicU64) {
    let prev = counter.fetch_sub(1, Ordering::Relaxed);
    assert!(prev > 0, "ban counter underflow");
}

impl BanStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A ban entered the list. Caller holds the ban lock.
    pub(crate) fn ban_added(&self, flags: BanFlags) {
        bump(&self.bans, 1);
        bump(&self.bans_added, 1);
        if flags.contains(BanFlags::OBJ) {
            bump(&self.bans_obj, 1);
        }
        if flags.contains(BanFlags::REQ) {
            bump(&self.bans_req, 1);
        }
        if flags.contains(BanFlags::COMPLETED) {
            bump(&self.bans_completed, 1);
        }
    }

    /// A ban left the list. Every counter matching its flags drops exactly once.
    /// Caller holds the ban lock.
    pub(crate) fn ban_removed(&self, flags: BanFlags, len: usize) {
        if flags.contains(BanFlags::COMPLETED) {
            drop_one(&self.bans_completed);
        }
        if flags.contains(BanFlags::OBJ) {
            drop_one(&self.bans_obj);
        }
        if flags.contains(BanFlags::REQ) {
            drop_one(&self.bans_req);
        }
        drop_one(&self.bans);
        bump(&self.bans_deleted, 1);
        bump(&self.bans_persisted_fragmentation, len as u64);
    }

    /// A ban was marked COMPLETED; its blob shrank from `from_len` to `to_len`.
    pub(crate) fn ban_completed(&self, from_len: usize, to_len: usize) {
        bump(&self.bans_completed, 1);
        bump(
            &self.bans_persisted_fragmentation,
            from_len.saturating_sub(to_len) as u64,
        );
    }

    pub(crate) fn dup(&self) {
        bump(&self.bans_dups, 1);
    }

    pub(crate) fn lurker_tested(&self, tests: u64) {
        bump(&self.bans_lurker_tested, 1);
        bump(&self.bans_lurker_tests_tested, tests);
    }

    pub(crate) fn lurker_killed(&self) {
        bump(&self.bans_lurker_obj_killed, 1);
    }

    pub(crate) fn lurker_contention(&self) {
        bump(&self.bans_lurker_contention, 1);
    }

    pub(crate) fn lurker_pass(&self) {
        bump(&self.bans_lurker_passes, 1);
    }

    pub(crate) fn lurker_aborted(&self) {
        bump(&self.bans_lurker_aborted, 1);
    }

    #[must_use]
    pub fn snapshot(&self) -> BanStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BanStatsSnapshot {
            bans: get(&self.bans),
            bans_added: get(&self.bans_added),
            bans_deleted: get(&self.bans_deleted),
            bans_completed: get(&self.bans_completed),
            bans_obj: get(&self.bans_obj),
            bans_req: get(&self.bans_req),
            bans_dups: get(&self.bans_dups),
            bans_persisted_fragmentation: get(&self.bans_persisted_fragmentation),
            bans_lurker_tested: get(&self.bans_lurker_tested),
            bans_lurker_tests_tested: get(&self.bans_lurker_tests_tested),
            bans_lurker_obj_killed: get(&self.bans_lurker_obj_killed),
            bans_lurker_contention: get(&self.bans_lurker_contention),
            bans_lurker_passes: get(&self.bans_lurker_passes),
            bans_lurker_aborted: get(&self.bans_lurker_aborted),
        }
    }
}
