//! The shared ban list.
//!
//! One mutex guards everything structural: list order, reference counts,
//! per-ban object queues and object membership. The same lock backs the
//! lurker's condition variable and its wake generation.
//!
//! Bans live in a generational arena and are linked newest-first. New bans
//! enter at the newest end; only the lurker removes them, and only from the
//! oldest end. The list is never empty.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::ban::evaluate::{BanEvaluator, RequestContext};
use crate::ban::queue::{NodeArena, NodeIdx, ObjQueue, QueueEntry};
use crate::ban::record::{Ban, BanFlags};
use crate::ban::spec::BanSpec;
use crate::ban::stats::BanStats;
use crate::store::{ObjCore, Xid};

/// Stable handle to a ban. Stale handles are detected, never reused silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BanId {
    index: u32,
    generation: u32,
}

impl fmt::Display for BanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ban#{}.{}", self.index, self.generation)
    }
}

/// Structural ban-list event reported to the accounting sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanInfo {
    /// A ban was added at the head.
    Insert,
    /// A ban was removed from the tail.
    Drop,
}

/// Receives ban insert/drop events, e.g. for persistence accounting.
pub trait BanInfoSink: Send + Sync + fmt::Debug {
    /// One structural event, with the ban's encoded predicate.
    fn ban_info(&self, event: BanInfo, blob: &[u8]);
}

/// Sink that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBanInfo;

impl BanInfoSink for NoBanInfo {
    fn ban_info(&self, _event: BanInfo, _blob: &[u8]) {}
}

/// Outcome of the request-path check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Survived every newer ban; now associated with the newest one.
    Fresh,
    /// Matched a newer ban and left the ban list; the caller expires it.
    Banned,
    /// The object is not on the ban list (never attached, or already banned).
    NotTracked,
}

pub(crate) struct BanSlot {
    pub(crate) ban: Arc<Ban>,
    pub(crate) refcount: u32,
    newer: Option<BanId>,
    older: Option<BanId>,
    pub(crate) queue: ObjQueue,
}

struct SlotEntry {
    generation: u32,
    slot: Option<BanSlot>,
}

#[derive(Debug, Clone, Copy)]
struct Membership {
    ban: BanId,
    node: NodeIdx,
}

/// Everything behind the ban lock.
pub(crate) struct BanState {
    entries: Vec<SlotEntry>,
    free: Vec<u32>,
    newest: BanId,
    oldest: BanId,
    len: usize,
    nodes: NodeArena,
    members: HashMap<Xid, Membership>,
    generation: u64,
}

pub(crate) type BanGuard<'a> = MutexGuard<'a, BanState>;

impl BanState {
    fn with_baseline(ban: Arc<Ban>) -> Self {
        let id = BanId {
            index: 0,
            generation: 0,
        };
        Self {
            entries: vec![SlotEntry {
                generation: 0,
                slot: Some(BanSlot {
                    ban,
                    refcount: 0,
                    newer: None,
                    older: None,
                    queue: ObjQueue::default(),
                }),
            }],
            free: Vec::new(),
            newest: id,
            oldest: id,
            len: 1,
            nodes: NodeArena::default(),
            members: HashMap::new(),
            generation: 0,
        }
    }

    fn get(&self, id: BanId) -> Option<&BanSlot> {
        self.entries
            .get(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.slot.as_ref())
    }

    pub(crate) fn slot(&self, id: BanId) -> &BanSlot {
        self.get(id)
            .unwrap_or_else(|| panic!("stale ban handle {id}"))
    }

    fn slot_mut(&mut self, id: BanId) -> &mut BanSlot {
        self.entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.slot.as_mut())
            .unwrap_or_else(|| panic!("stale ban handle {id}"))
    }

    pub(crate) fn newest(&self) -> BanId {
        self.newest
    }

    pub(crate) fn oldest(&self) -> BanId {
        self.oldest
    }

    pub(crate) fn newer(&self, id: BanId) -> Option<BanId> {
        self.slot(id).newer
    }

    pub(crate) fn older(&self, id: BanId) -> Option<BanId> {
        self.slot(id).older
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn push_newest(&mut self, ban: Arc<Ban>) -> BanId {
        let slot = BanSlot {
            ban,
            refcount: 0,
            newer: None,
            older: Some(self.newest),
            queue: ObjQueue::default(),
        };
        let id = if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.slot = Some(slot);
            BanId {
                index,
                generation: entry.generation,
            }
        } else {
            let Ok(index) = u32::try_from(self.entries.len()) else {
                panic!("ban arena exhausted");
            };
            self.entries.push(SlotEntry {
                generation: 0,
                slot: Some(slot),
            });
            BanId {
                index,
                generation: 0,
            }
        };
        let prev_newest = self.newest;
        self.slot_mut(prev_newest).newer = Some(id);
        self.newest = id;
        self.len += 1;
        id
    }

    /// Unlink the oldest ban. The list keeps at least one entry.
    pub(crate) fn remove_oldest(&mut self) -> BanSlot {
        assert!(self.len > 1, "the last ban is never removed");
        let id = self.oldest;
        let entry = &mut self.entries[id.index as usize];
        let slot = entry
            .slot
            .take()
            .unwrap_or_else(|| panic!("stale ban handle {id}"));
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);

        assert!(slot.queue.is_empty(), "removing {id} with queued objects");
        let Some(newer) = slot.newer else {
            panic!("{id} is not linked to a newer ban");
        };
        self.slot_mut(newer).older = None;
        self.oldest = newer;
        self.len -= 1;
        slot
    }

    fn enqueue_member(&mut self, id: BanId, oc: &Arc<ObjCore>) {
        let xid = oc.xid();
        let node = {
            let Self { entries, nodes, .. } = self;
            let slot = entries[id.index as usize]
                .slot
                .as_mut()
                .unwrap_or_else(|| panic!("stale ban handle {id}"));
            slot.refcount += 1;
            slot.queue
                .push_back(nodes, QueueEntry::Object(Arc::clone(oc)))
        };
        let prev = self.members.insert(xid, Membership { ban: id, node });
        assert!(prev.is_none(), "object {xid} is already on a ban queue");
    }

    fn remove_member(&mut self, xid: Xid) -> Option<BanId> {
        let m = self.members.remove(&xid)?;
        let Self { entries, nodes, .. } = self;
        let slot = entries[m.ban.index as usize]
            .slot
            .as_mut()
            .unwrap_or_else(|| panic!("stale ban handle {}", m.ban));
        slot.queue.unlink(nodes, m.node);
        assert!(slot.refcount > 0, "ban refcount underflow on {}", m.ban);
        slot.refcount -= 1;
        Some(m.ban)
    }

    pub(crate) fn queue_is_empty(&self, id: BanId) -> bool {
        self.slot(id).queue.is_empty()
    }

    /// Append the end-of-pass marker to a ban's queue.
    pub(crate) fn push_marker(&mut self, id: BanId) {
        let Self { entries, nodes, .. } = self;
        let slot = entries[id.index as usize]
            .slot
            .as_mut()
            .unwrap_or_else(|| panic!("stale ban handle {id}"));
        slot.queue.push_back(nodes, QueueEntry::EndOfPass);
    }

    /// Peek the head of a ban's queue.
    pub(crate) fn queue_front(&self, id: BanId) -> Option<(NodeIdx, QueueEntry)> {
        self.slot(id)
            .queue
            .front(&self.nodes)
            .map(|(idx, entry)| (idx, entry.clone()))
    }

    /// Dequeue the marker sitting at `node`.
    pub(crate) fn pop_marker(&mut self, id: BanId, node: NodeIdx) {
        let Self { entries, nodes, .. } = self;
        let slot = entries[id.index as usize]
            .slot
            .as_mut()
            .unwrap_or_else(|| panic!("stale ban handle {id}"));
        let entry = slot.queue.unlink(nodes, node);
        assert!(entry.is_marker(), "{id}: expected the end-of-pass marker");
    }

    /// Drop a marker wherever it is in the queue (abandoned pass).
    pub(crate) fn discard_marker(&mut self, id: BanId) {
        if let Some(node) = self.slot(id).queue.find(&self.nodes, QueueEntry::is_marker) {
            self.pop_marker(id, node);
        }
    }

    /// Round-robin: move an object from the head of its queue to the tail.
    pub(crate) fn requeue_tail(&mut self, id: BanId, node: NodeIdx) {
        let Self { entries, nodes, .. } = self;
        let slot = entries[id.index as usize]
            .slot
            .as_mut()
            .unwrap_or_else(|| panic!("stale ban handle {id}"));
        slot.queue.move_to_back(nodes, node);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

/// The ban list shared by the request path and the lurker.
pub struct BanList {
    state: Mutex<BanState>,
    lurker_cond: Condvar,
    stats: BanStats,
    info: Arc<dyn BanInfoSink>,
}

impl fmt::Debug for BanList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BanList")
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl BanList {
    /// Create a list holding only the baseline ban, created at `now`.
    #[must_use]
    pub fn new(now: SystemTime) -> Self {
        Self::with_info_sink(now, Arc::new(NoBanInfo))
    }

    /// Like [`BanList::new`], reporting insertions and drops to `info`.
    #[must_use]
    pub fn with_info_sink(now: SystemTime, info: Arc<dyn BanInfoSink>) -> Self {
        let baseline = Arc::new(Ban::new(BanSpec::baseline(now), BanFlags::COMPLETED));
        let stats = BanStats::new();
        stats.ban_added(baseline.flags());
        Self {
            state: Mutex::new(BanState::with_baseline(baseline)),
            lurker_cond: Condvar::new(),
            stats,
            info,
        }
    }

    pub(crate) fn lock(&self) -> BanGuard<'_> {
        self.state.lock()
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> &BanStats {
        &self.stats
    }

    pub(crate) fn info(&self) -> &dyn BanInfoSink {
        self.info.as_ref()
    }

    /// Insert a ban at the newest end and wake the lurker.
    ///
    /// Older, not yet completed bans with an identical predicate are
    /// superseded: they are marked COMPLETED on the spot.
    pub fn insert(&self, spec: BanSpec) -> BanId {
        let ban = Arc::new(Ban::new(spec, BanFlags::empty()));
        let mut st = self.state.lock();
        let id = st.push_newest(Arc::clone(&ban));
        self.stats.ban_added(ban.flags());

        let mut cursor = st.older(id);
        while let Some(older) = cursor {
            let old = &st.slot(older).ban;
            if !old.is_completed()
                && old.spec().same_predicate(ban.spec())
                && self.mark_completed_locked(&st, older)
            {
                self.stats.dup();
            }
            cursor = st.older(older);
        }

        self.info.ban_info(BanInfo::Insert, ban.spec().blob());
        st.generation = st.generation.wrapping_add(1);
        self.lurker_cond.notify_one();
        id
    }

    /// Enroll a newly cached object under the newest ban.
    pub fn attach(&self, oc: &Arc<ObjCore>) -> BanId {
        let mut st = self.state.lock();
        let id = st.newest;
        st.enqueue_member(id, oc);
        id
    }

    /// Remove an object from the ban list. Returns false if it was not on it.
    pub fn detach(&self, oc: &ObjCore) -> bool {
        self.state.lock().remove_member(oc.xid()).is_some()
    }

    /// Request-path check: test the object against every live ban newer than
    /// the one it was last cleared against.
    ///
    /// Evaluation runs without the ban lock. Membership pins the object's ban,
    /// and with it every newer ban, so the snapshot stays valid.
    ///
    /// Lookups call this with the object's head lock held, so neither this
    /// nor the evaluator may take a head lock.
    pub fn check_object(
        &self,
        oc: &Arc<ObjCore>,
        req: Option<&RequestContext>,
        evaluator: &dyn BanEvaluator,
    ) -> CheckOutcome {
        let xid = oc.xid();
        let (start, newest, pending) = {
            let st = self.state.lock();
            let Some(m) = st.members.get(&xid).copied() else {
                return CheckOutcome::NotTracked;
            };
            if m.ban == st.newest {
                return CheckOutcome::Fresh;
            }
            let mut pending = Vec::new();
            let mut cursor = Some(st.newest);
            while let Some(b) = cursor {
                if b == m.ban {
                    break;
                }
                pending.push(Arc::clone(&st.slot(b).ban));
                cursor = st.older(b);
            }
            (m.ban, st.newest, pending)
        };

        let banned = pending
            .iter()
            .filter(|ban| !ban.is_completed())
            .any(|ban| evaluator.evaluate(ban.spec(), oc, req).matched);

        let mut st = self.state.lock();
        let still_there = st.members.get(&xid).is_some_and(|m| m.ban == start);
        if still_there {
            st.remove_member(xid);
            if !banned {
                st.enqueue_member(newest, oc);
            }
        }
        if banned {
            CheckOutcome::Banned
        } else {
            CheckOutcome::Fresh
        }
    }

    /// Mark a ban COMPLETED. Returns false if it already was.
    pub fn mark_completed(&self, id: BanId) -> bool {
        let st = self.state.lock();
        self.mark_completed_locked(&st, id)
    }

    pub(crate) fn mark_completed_locked(&self, st: &BanState, id: BanId) -> bool {
        let ban = &st.slot(id).ban;
        let from = ban.len();
        if !ban.set_completed() {
            return false;
        }
        self.stats.ban_completed(from, ban.len());
        true
    }

    /// Take a reference on a ban, e.g. for a request in flight.
    pub fn hold(self: &Arc<Self>, id: BanId) -> Option<BanHold> {
        let mut st = self.state.lock();
        let entry = st
            .entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)?;
        entry.slot.as_mut()?.refcount += 1;
        Some(BanHold {
            list: Arc::clone(self),
            id,
        })
    }

    /// Reference the newest ban.
    pub fn hold_newest(self: &Arc<Self>) -> BanHold {
        let mut st = self.state.lock();
        let id = st.newest;
        st.slot_mut(id).refcount += 1;
        BanHold {
            list: Arc::clone(self),
            id,
        }
    }

    /// Request an expedited lurker cycle.
    pub fn kick(&self) {
        let mut st = self.state.lock();
        st.generation = st.generation.wrapping_add(1);
        self.lurker_cond.notify_one();
    }

    /// Current wake generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Block until kicked past `seen` or until `deadline`.
    /// Returns true when woken by a kick.
    pub(crate) fn wait_for_kick(&self, seen: u64, deadline: Instant) -> bool {
        let mut st = self.state.lock();
        while st.generation == seen {
            if self.lurker_cond.wait_until(&mut st, deadline).timed_out() {
                return st.generation != seen;
            }
        }
        true
    }

    // ──────────────────── inspection ────────────────────

    /// Bans on the list, baseline included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    /// Never true; the baseline entry always remains.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recently inserted ban.
    #[must_use]
    pub fn newest(&self) -> BanId {
        self.state.lock().newest
    }

    /// Tail of the list.
    #[must_use]
    pub fn oldest(&self) -> BanId {
        self.state.lock().oldest
    }

    /// Every live id, head to tail.
    #[must_use]
    pub fn ids_newest_first(&self) -> Vec<BanId> {
        let st = self.state.lock();
        let mut out = Vec::with_capacity(st.len);
        let mut cursor = Some(st.newest);
        while let Some(id) = cursor {
            out.push(id);
            cursor = st.older(id);
        }
        out
    }

    /// The ban behind `id`, or `None` once reaped.
    #[must_use]
    pub fn ban(&self, id: BanId) -> Option<Arc<Ban>> {
        self.state.lock().get(id).map(|s| Arc::clone(&s.ban))
    }

    /// Objects plus holds referencing `id`.
    #[must_use]
    pub fn refcount(&self, id: BanId) -> Option<u32> {
        self.state.lock().get(id).map(|s| s.refcount)
    }

    /// Queue length of `id`, markers included.
    #[must_use]
    pub fn queue_len(&self, id: BanId) -> Option<usize> {
        self.state.lock().get(id).map(|s| s.queue.len())
    }

    /// Objects queued under a ban, in queue order. Markers are skipped.
    #[must_use]
    pub fn queue_xids(&self, id: BanId) -> Vec<Xid> {
        let st = self.state.lock();
        st.get(id).map_or_else(Vec::new, |s| {
            s.queue
                .iter(&st.nodes)
                .filter_map(|e| match e {
                    QueueEntry::Object(oc) => Some(oc.xid()),
                    QueueEntry::EndOfPass => None,
                })
                .collect()
        })
    }

    /// Markers currently sitting in any queue. Zero between passes.
    #[must_use]
    pub fn markers_in_queues(&self) -> usize {
        let st = self.state.lock();
        let mut cursor = Some(st.newest);
        let mut count = 0;
        while let Some(id) = cursor {
            count += st
                .slot(id)
                .queue
                .iter(&st.nodes)
                .filter(|e| e.is_marker())
                .count();
            cursor = st.older(id);
        }
        count
    }

    /// The ban an object was last cleared against.
    #[must_use]
    pub fn ban_of(&self, xid: Xid) -> Option<BanId> {
        self.state.lock().members.get(&xid).map(|m| m.ban)
    }

    /// Number of objects on the ban list.
    #[must_use]
    pub fn tracked_objects(&self) -> usize {
        self.state.lock().members.len()
    }
}

/// A counted reference on a ban, released on drop.
#[derive(Debug)]
pub struct BanHold {
    list: Arc<BanList>,
    id: BanId,
}

impl BanHold {
    /// The held ban.
    #[must_use]
    pub fn id(&self) -> BanId {
        self.id
    }
}

impl Drop for BanHold {
    fn drop(&mut self) {
        let mut st = self.list.state.lock();
        let slot = st.slot_mut(self.id);
        assert!(slot.refcount > 0, "ban refcount underflow on {}", self.id);
        slot.refcount -= 1;
    }
}
