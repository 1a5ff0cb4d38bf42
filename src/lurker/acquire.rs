//! Taking the next object off a ban's queue.
//!
//! The canonical order is object head first, ban list second. We come the
//! other way: with the ban lock held we only ever *try* the head lock, and
//! when that fails we drop everything, back off, and start over.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::ban::list::{BanId, BanList};
use crate::ban::queue::QueueEntry;
use crate::core::config::ParamSnapshot;
use crate::logger::trace::TraceBuffer;
use crate::store::ObjCore;

/// Result of one acquisition.
#[derive(Debug)]
pub enum Acquired {
    /// A live object carrying an extra reference the caller must drop.
    Object(Arc<ObjCore>),
    /// The end-of-pass marker was reached and removed.
    Exhausted,
    /// Retry budget spent; the marker has been removed.
    GaveUp,
}

/// Pulls test candidates off one ban queue under the inverted lock order.
#[derive(Debug, Clone, Copy)]
pub struct ObjectAcquirer<'a> {
    bans: &'a BanList,
    backoff: Duration,
    retry_limit: u32,
}

impl<'a> ObjectAcquirer<'a> {
    /// Acquirer using `params`' backoff and retry limit.
    #[must_use]
    pub fn new(bans: &'a BanList, params: &ParamSnapshot) -> Self {
        Self {
            bans,
            backoff: params.backoff(),
            retry_limit: params.contention_retry_limit,
        }
    }

    /// Next object from `bt`'s queue, which must hold the end-of-pass marker.
    ///
    /// An acquired object is moved to the back of the queue, behind the
    /// marker, so it is not seen twice in one pass and a stuck object cannot
    /// starve the ones behind it.
    pub fn acquire(&self, bt: BanId, trace: &mut TraceBuffer) -> Acquired {
        let mut failures: u32 = 0;
        loop {
            {
                let mut st = self.bans.lock();
                let Some((node, entry)) = st.queue_front(bt) else {
                    panic!("{bt}: queue emptied without its end-of-pass marker");
                };
                match entry {
                    QueueEntry::EndOfPass => {
                        st.pop_marker(bt, node);
                        return Acquired::Exhausted;
                    }
                    QueueEntry::Object(oc) => {
                        let head = Arc::clone(oc.head());
                        let taken = match head.try_lock() {
                            // Zero means the store is dismantling it; wait for the detach.
                            Some(mut hs) if hs.refcnt(oc.xid()) > 0 => {
                                oc.add_ref_locked(&mut hs);
                                true
                            }
                            _ => false,
                        };
                        if taken {
                            st.requeue_tail(bt, node);
                            return Acquired::Object(oc);
                        }
                    }
                }
            }

            self.bans.stats().lurker_contention();
            failures += 1;
            if self.retry_limit > 0 && failures > self.retry_limit {
                self.bans.lock().discard_marker(bt);
                self.bans.stats().lurker_aborted();
                return Acquired::GaveUp;
            }
            trace.flush();
            thread::sleep(self.backoff);
        }
    }
}
