//! A single ban: immutable predicate plus its mutable flag set.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, SystemTime};

use crate::ban::spec::{BANS_HEAD_LEN, BanSpec};

/// Ban flag set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BanFlags(u8);

impl BanFlags {
    /// Has at least one request-scoped test.
    pub const REQ: Self = Self(1 << 0);
    /// Has at least one object-scoped test.
    pub const OBJ: Self = Self(1 << 1);
    /// Every resident object has been proven clean against this ban.
    pub const COMPLETED: Self = Self(1 << 2);

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bit pattern.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set every flag in `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Flags set in either operand.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Debug for BanFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::REQ) {
            names.push("REQ");
        }
        if self.contains(Self::OBJ) {
            names.push("OBJ");
        }
        if self.contains(Self::COMPLETED) {
            names.push("COMPLETED");
        }
        write!(f, "BanFlags({})", names.join("|"))
    }
}

/// A ban as shared between the list and any thread evaluating it.
///
/// The predicate never changes; the only flag transition after insertion is
/// the one-way move to COMPLETED.
pub struct Ban {
    spec: BanSpec,
    flags: AtomicU8,
}

impl Ban {
    pub(crate) fn new(spec: BanSpec, flags: BanFlags) -> Self {
        let initial = flags.union(spec.scope());
        Self {
            spec,
            flags: AtomicU8::new(initial.bits()),
        }
    }

    /// The immutable predicate.
    #[must_use]
    pub fn spec(&self) -> &BanSpec {
        &self.spec
    }

    /// Current flags, COMPLETED included.
    #[must_use]
    pub fn flags(&self) -> BanFlags {
        BanFlags(self.flags.load(Ordering::Acquire))
    }

    /// True once the ban has been retired.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.flags().contains(BanFlags::COMPLETED)
    }

    /// Bans with any request-scoped test cannot be lazily matched against
    /// resident objects: there is no request to evaluate them with.
    #[must_use]
    pub fn has_request_scope(&self) -> bool {
        self.flags().contains(BanFlags::REQ)
    }

    /// Insertion time.
    #[must_use]
    pub fn created(&self) -> SystemTime {
        self.spec.created()
    }

    /// Time since insertion; zero for bans from the future.
    #[must_use]
    pub fn age(&self, now: SystemTime) -> Duration {
        self.spec.age(now)
    }

    /// Reported predicate length. A completed ban only keeps its header.
    #[must_use]
    pub fn len(&self) -> usize {
        if self.is_completed() {
            BANS_HEAD_LEN
        } else {
            self.spec.len()
        }
    }

    /// Set COMPLETED. Returns false when it was already set.
    pub(crate) fn set_completed(&self) -> bool {
        let prev = self
            .flags
            .fetch_or(BanFlags::COMPLETED.bits(), Ordering::AcqRel);
        prev & BanFlags::COMPLETED.bits() == 0
    }
}

impl fmt::Debug for Ban {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ban")
            .field("spec", &self.spec.to_string())
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}
