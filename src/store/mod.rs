//! Resident objects and their per-key lock domains.
//!
//! An [`ObjHead`] groups every variant cached under one key behind a single
//! mutex. The mutable per-object state ([`CoreState`]: reference count, BUSY,
//! expiry) lives inside that mutex, so it is only reachable with the domain
//! lock held. [`ObjCore`] is the shared, immutable identity of one variant.
//!
//! Canonical lock order elsewhere in the cache is object head first, ban list
//! second. The lurker is the only code that goes the other way, and it only
//! ever uses [`ObjHead::try_lock`] to do so.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Mutex, MutexGuard};

use crate::ban::list::BanList;

/// Transaction id of the request that created an object; unique per object.
pub type Xid = u64;

/// Expiry metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    /// Time the TTL counts from.
    pub t_origin: SystemTime,
    /// Fresh lifetime.
    pub ttl: Duration,
    /// Stale-while-revalidate window after the TTL.
    pub grace: Duration,
    /// Conditional-fetch window after grace.
    pub keep: Duration,
}

impl Expiry {
    /// Fresh for `ttl` from `t_origin`, no grace or keep.
    #[must_use]
    pub fn new(t_origin: SystemTime, ttl: Duration) -> Self {
        Self {
            t_origin,
            ttl,
            grace: Duration::ZERO,
            keep: Duration::ZERO,
        }
    }

    /// Expire at `now`: the object is no longer fresh, stale or kept.
    pub fn rearm(&mut self, now: SystemTime) {
        self.t_origin = now;
        self.ttl = Duration::ZERO;
        self.grace = Duration::ZERO;
        self.keep = Duration::ZERO;
    }

    /// Point after which nothing about the object is usable.
    #[must_use]
    pub fn deadline(&self) -> SystemTime {
        self.t_origin + self.ttl + self.grace + self.keep
    }

    /// True once `now` reaches [`Self::deadline`].
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.deadline()
    }
}

/// Mutable per-object state, guarded by the owning head's mutex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreState {
    /// Outstanding references, the cache's own included.
    pub refcnt: u32,
    /// Set while a fetch is still filling the object.
    pub busy: bool,
    /// Expiry metadata.
    pub exp: Expiry,
}

/// Contents of one lock domain.
#[derive(Debug, Default)]
pub struct HeadState {
    cores: HashMap<Xid, CoreState>,
}

impl HeadState {
    /// State of one variant, if still present.
    #[must_use]
    pub fn core(&self, xid: Xid) -> Option<&CoreState> {
        self.cores.get(&xid)
    }

    /// Mutable state of one variant, if still present.
    pub fn core_mut(&mut self, xid: Xid) -> Option<&mut CoreState> {
        self.cores.get_mut(&xid)
    }

    /// Reference count of a variant; a variant no longer present counts as zero.
    #[must_use]
    pub fn refcnt(&self, xid: Xid) -> u32 {
        self.cores.get(&xid).map_or(0, |c| c.refcnt)
    }

    /// Variants present under this head.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cores.len()
    }

    /// True once every variant has been dismantled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }
}

/// Per-key lock domain.
pub struct ObjHead {
    key: String,
    state: Mutex<HeadState>,
}

impl ObjHead {
    /// Empty lock domain for `key`.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            state: Mutex::new(HeadState::default()),
        })
    }

    /// Cache key, e.g. the URL path.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Blocking acquisition, for callers following the canonical order.
    pub fn lock(&self) -> MutexGuard<'_, HeadState> {
        self.state.lock()
    }

    /// Non-blocking acquisition, for callers already holding the ban lock.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, HeadState>> {
        self.state.try_lock()
    }
}

impl fmt::Debug for ObjHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjHead")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// One cached variant.
pub struct ObjCore {
    xid: Xid,
    head: Arc<ObjHead>,
    headers: HashMap<String, String>,
}

impl ObjCore {
    /// Create a variant under `head` holding the cache's own reference.
    pub fn insert(
        head: &Arc<ObjHead>,
        xid: Xid,
        headers: HashMap<String, String>,
        exp: Expiry,
    ) -> Arc<Self> {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        let oc = Arc::new(Self {
            xid,
            head: Arc::clone(head),
            headers,
        });
        let prev = head.lock().cores.insert(
            xid,
            CoreState {
                refcnt: 1,
                busy: false,
                exp,
            },
        );
        assert!(prev.is_none(), "duplicate xid {xid} under {}", head.key);
        oc
    }

    /// External identifier used in trace records.
    #[must_use]
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// Lock domain this variant belongs to.
    #[must_use]
    pub fn head(&self) -> &Arc<ObjHead> {
        &self.head
    }

    /// Stored response header, matched case-insensitively on the name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Add a reference with the head lock already held.
    ///
    /// Taking a reference on a BUSY object is a contract violation.
    pub fn add_ref_locked(&self, head: &mut HeadState) {
        let core = head
            .core_mut(self.xid)
            .unwrap_or_else(|| panic!("object {} not present under its head", self.xid));
        assert!(!core.busy, "reference taken on busy object {}", self.xid);
        assert!(core.refcnt > 0, "reference taken on dying object {}", self.xid);
        core.refcnt += 1;
    }

    /// Add a reference (request-path hit).
    pub fn add_ref(&self) {
        let mut head = self.head.lock();
        self.add_ref_locked(&mut head);
    }

    /// Flip the BUSY flag, e.g. while a fetch is filling the object.
    pub fn set_busy(&self, busy: bool) {
        if let Some(core) = self.head.lock().core_mut(self.xid) {
            core.busy = busy;
        }
    }

    /// Current reference count. Takes the head lock.
    #[must_use]
    pub fn refcnt(&self) -> u32 {
        self.head.lock().refcnt(self.xid)
    }

    /// Current expiry, or `None` once dismantled. Takes the head lock.
    #[must_use]
    pub fn expiry(&self) -> Option<Expiry> {
        self.head.lock().core(self.xid).map(|c| c.exp)
    }
}

impl fmt::Debug for ObjCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjCore")
            .field("xid", &self.xid)
            .field("head", &self.head.key)
            .finish_non_exhaustive()
    }
}

/// Drop one reference. At zero the variant is dismantled: removed from its
/// head, then from the ban list. Returns true when this was the last reference.
pub fn deref_objcore(bans: &BanList, oc: &Arc<ObjCore>) -> bool {
    let last = {
        let mut head = oc.head.lock();
        let core = head
            .core_mut(oc.xid)
            .unwrap_or_else(|| panic!("deref of absent object {}", oc.xid));
        assert!(core.refcnt > 0, "refcount underflow on object {}", oc.xid);
        core.refcnt -= 1;
        let last = core.refcnt == 0;
        if last {
            head.cores.remove(&oc.xid);
        }
        last
    };
    if last {
        bans.detach(oc);
    }
    last
}

/// Notification that an object's expiry was pulled in.
#[derive(Debug, Clone)]
pub struct Rearmed {
    /// The object whose expiry now lies in the past.
    pub object: Arc<ObjCore>,
    /// Time it was rearmed to.
    pub at: SystemTime,
}

/// Hand-off point to the expiry pipeline.
#[derive(Debug, Clone)]
pub struct ExpiryInbox {
    tx: Sender<Rearmed>,
}

impl ExpiryInbox {
    /// Create an inbox and the receiving end the expiry pipeline drains.
    #[must_use]
    pub fn channel() -> (Self, Receiver<Rearmed>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    /// Force the object's expiry to `now` and post it to the pipeline.
    /// Physical removal is the pipeline's business.
    pub fn rearm(&self, oc: &Arc<ObjCore>, now: SystemTime) {
        if let Some(core) = oc.head.lock().core_mut(oc.xid) {
            core.exp.rearm(now);
        }
        // A closed pipeline means shutdown; the rearm itself already happened.
        let _ = self.tx.send(Rearmed {
            object: Arc::clone(oc),
            at: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn t0() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(10_000)
    }

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn insert_holds_one_reference() {
        let head = ObjHead::new("/a");
        let oc = ObjCore::insert(&head, 1, headers(&[("X-Tag", "red")]), Expiry::new(t0(), Duration::from_secs(60)));
        assert_eq!(oc.refcnt(), 1);
        assert_eq!(oc.header("x-tag"), Some("red"));
        assert_eq!(oc.header("X-TAG"), Some("red"));
        oc.add_ref();
        assert_eq!(oc.refcnt(), 2);
    }

    #[test]
    fn deref_to_zero_dismantles() {
        let bans = BanList::new(t0());
        let head = ObjHead::new("/a");
        let oc = ObjCore::insert(&head, 7, HashMap::new(), Expiry::new(t0(), Duration::from_secs(1)));
        bans.attach(&oc);
        oc.add_ref();
        assert!(!deref_objcore(&bans, &oc));
        assert!(deref_objcore(&bans, &oc));
        assert!(head.lock().is_empty());
        assert_eq!(oc.refcnt(), 0);
        assert_eq!(bans.ban_of(7), None);
    }

    #[test]
    #[should_panic(expected = "busy")]
    fn reference_on_busy_object_is_fatal() {
        let head = ObjHead::new("/a");
        let oc = ObjCore::insert(&head, 1, HashMap::new(), Expiry::new(t0(), Duration::from_secs(1)));
        oc.set_busy(true);
        oc.add_ref();
    }

    #[test]
    fn try_lock_fails_while_held() {
        let head = ObjHead::new("/a");
        let guard = head.lock();
        assert!(head.try_lock().is_none());
        drop(guard);
        assert!(head.try_lock().is_some());
    }

    #[test]
    fn rearm_expires_now_and_notifies() {
        let head = ObjHead::new("/a");
        let oc = ObjCore::insert(&head, 3, HashMap::new(), Expiry::new(t0(), Duration::from_secs(3600)));
        let (inbox, rx) = ExpiryInbox::channel();
        let now = t0() + Duration::from_secs(5);
        inbox.rearm(&oc, now);
        let exp = oc.expiry().unwrap();
        assert_eq!(exp.deadline(), now);
        assert!(exp.is_expired(now));
        let note = rx.try_recv().unwrap();
        assert_eq!(note.object.xid(), 3);
        assert_eq!(note.at, now);
    }
}
