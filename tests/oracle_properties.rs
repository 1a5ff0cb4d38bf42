//! Lazy evaluation agrees with testing every object against every newer ban.

mod common;

use std::collections::BTreeSet;

use ban_lurker::ban::list::CheckOutcome;
use ban_lurker::lurker::planner::PassOutcome;
use ban_lurker::store::Xid;
use proptest::prelude::*;

use common::{Cache, params};

#[derive(Debug, Clone)]
enum Op {
    Cache(u8),
    Ban(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..5).prop_map(Op::Cache),
        1 => (0u8..5).prop_map(Op::Ban),
    ]
}

/// Replay `ops` into a fresh cache and compute the eager answer: an object
/// is banned iff some ban inserted after it matches its tag.
fn build(ops: &[Op]) -> (Cache, BTreeSet<Xid>, usize) {
    let mut c = Cache::new();
    let mut tags: Vec<(Xid, u8)> = Vec::new();
    let mut banned = BTreeSet::new();
    let mut bans = 0;
    for (i, op) in ops.iter().enumerate() {
        match *op {
            Op::Cache(tag) => {
                let xid = i as Xid;
                c.solo(xid, &format!("t{tag}"));
                tags.push((xid, tag));
            }
            Op::Ban(tag) => {
                c.ban(&format!("t{tag}"));
                bans += 1;
                banned.extend(tags.iter().filter(|(_, t)| *t == tag).map(|(x, _)| *x));
            }
        }
    }
    (c, banned, bans)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn one_pass_kills_exactly_the_oracle_set(ops in prop::collection::vec(op(), 0..40)) {
        let (mut c, expected, bans) = build(&ops);
        let out = c.pass(params(0.0, 0));
        let killed: BTreeSet<Xid> = c.expire().into_iter().collect();
        prop_assert_eq!(&killed, &expected);

        match out {
            PassOutcome::NoWork => prop_assert_eq!(bans, 0),
            PassOutcome::Done { killed: n, .. } => prop_assert_eq!(n as usize, expected.len()),
            PassOutcome::Aborted { .. } => prop_assert!(false, "no contention, no abort"),
        }

        // Everything but the baseline is completed and no marker is left behind.
        for id in c.bans().ids_newest_first() {
            prop_assert!(c.bans().ban(id).unwrap().is_completed());
        }
        prop_assert_eq!(c.bans().markers_in_queues(), 0);
    }

    #[test]
    fn lookups_ban_exactly_the_oracle_set(ops in prop::collection::vec(op(), 0..40)) {
        let (mut c, expected, _) = build(&ops);
        let xids: Vec<Xid> = c.resident.keys().copied().collect();
        let mut banned = BTreeSet::new();
        for xid in xids {
            if c.lookup(xid) == CheckOutcome::Banned {
                banned.insert(xid);
            }
        }
        prop_assert_eq!(&banned, &expected);

        // Survivors now sit on the newest ban and look up fresh.
        let newest = c.bans().newest();
        let survivors: Vec<Xid> = c.resident.keys().copied().collect();
        for xid in survivors {
            prop_assert_eq!(c.bans().ban_of(xid), Some(newest));
            prop_assert_eq!(c.lookup(xid), CheckOutcome::Fresh);
        }
    }

    #[test]
    fn lurker_then_lookup_never_double_bans(ops in prop::collection::vec(op(), 0..40)) {
        let (mut c, expected, _) = build(&ops);
        c.pass(params(0.0, 0));
        let killed: BTreeSet<Xid> = c.expire().into_iter().collect();
        let xids: Vec<Xid> = c.resident.keys().copied().collect();
        for xid in xids {
            prop_assert_eq!(c.lookup(xid), CheckOutcome::Fresh);
        }
        prop_assert_eq!(killed, expected);
    }
}
