//! Removing bans nobody references from the oldest end of the list.

use crate::ban::list::{BanInfo, BanList};
use crate::logger::trace::{TraceBuffer, TraceTag};

/// What one reap removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Bans removed.
    pub removed: usize,
    /// Sum of the reported lengths of the removed bans.
    pub bytes: u64,
}

/// Garbage collector for the list tail.
#[derive(Debug, Clone, Copy)]
pub struct TailReaper<'a> {
    bans: &'a BanList,
}

impl<'a> TailReaper<'a> {
    /// Reaper over `bans`.
    #[must_use]
    pub fn new(bans: &'a BanList) -> Self {
        Self { bans }
    }

    /// Pop unreferenced bans off the tail until a referenced one, or the last
    /// one, is left. Each record is freed after the lock is released.
    pub fn reap(&self, trace: &mut TraceBuffer) -> ReapReport {
        let mut report = ReapReport::default();
        loop {
            let slot = {
                let mut st = self.bans.lock();
                if st.len() <= 1 || st.slot(st.oldest()).refcount != 0 {
                    break;
                }
                let id = st.oldest();
                let slot = st.remove_oldest();
                let ban = &slot.ban;
                let len = ban.len();
                self.bans.stats().ban_removed(ban.flags(), len);
                let blob = ban.spec().blob();
                self.bans
                    .info()
                    .ban_info(BanInfo::Drop, &blob[..len.min(blob.len())]);
                trace.info(TraceTag::BanDrop, format!("{id} dropped ({len} bytes)"));
                slot
            };
            report.removed += 1;
            report.bytes += slot.ban.len() as u64;
            drop(slot);
        }
        report
    }
}
