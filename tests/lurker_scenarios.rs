//! End-to-end lurker behaviour against a synthetic single-threaded cache.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ban_lurker::ban::list::CheckOutcome;
use ban_lurker::ban::record::BanFlags;
use ban_lurker::core::config::LurkerParams;
use ban_lurker::logger::trace::{MemorySink, TraceTag};
use ban_lurker::lurker::planner::PassOutcome;
use ban_lurker::lurker::scheduler::spawn_lurker;
use ban_lurker::store::{ObjHead, deref_objcore};

use common::{Cache, params, url_ban};

// ════════════════════════════════════════════════════════════════
// SCENARIO A: age filter and completion
// ════════════════════════════════════════════════════════════════

#[test]
fn only_old_enough_bans_are_tested_and_completed() {
    let mut c = Cache::new();
    let base = c.bans().newest();
    c.solo(1, "keep");
    let b1 = c.ban("gone");
    c.advance(1000);
    let b2 = c.ban("other");

    let out = c.pass(params(500.0, 0));
    assert_eq!(
        out,
        PassOutcome::Done {
            completed: 1,
            killed: 0
        }
    );
    assert!(c.bans().ban(b1).unwrap().is_completed());
    assert!(!c.bans().ban(b2).unwrap().is_completed());
    // Survivors stay where they were; only lookups move objects forward.
    assert_eq!(c.bans().ban_of(1), Some(base));
    assert_eq!(c.bans().markers_in_queues(), 0);
    assert_eq!(c.bans().stats().snapshot().bans_lurker_tested, 1);
}

#[test]
fn contended_object_holds_back_completion() {
    let mut c = Cache::new();
    let base = c.bans().newest();
    let head = ObjHead::new("/contended");
    c.object(&head, 1, "keep");
    let b1 = c.ban("gone");
    c.advance(1000);
    c.ban("other");

    {
        let _held = head.lock();
        let out = c.pass(params(500.0, 2));
        assert_eq!(
            out,
            PassOutcome::Aborted {
                completed: 0,
                killed: 0
            }
        );
    }
    assert!(!c.bans().ban(b1).unwrap().is_completed());
    assert_eq!(c.bans().ban_of(1), Some(base));
    assert_eq!(c.bans().markers_in_queues(), 0);
    let snap = c.bans().stats().snapshot();
    assert_eq!(snap.bans_lurker_contention, 3);
    assert_eq!(snap.bans_lurker_aborted, 1);

    let out = c.pass(params(500.0, 2));
    assert_eq!(
        out,
        PassOutcome::Done {
            completed: 1,
            killed: 0
        }
    );
    assert!(c.bans().ban(b1).unwrap().is_completed());
}

#[test]
fn matching_object_is_rearmed_and_list_collapses() {
    let mut c = Cache::new();
    c.solo(1, "gone");
    c.solo(2, "keep");
    let b1 = c.ban("gone");
    c.advance(1000);
    let b2 = c.ban("other");

    let out = c.pass(params(500.0, 0));
    assert_eq!(
        out,
        PassOutcome::Done {
            completed: 1,
            killed: 1
        }
    );
    assert_eq!(
        c.trace.messages(TraceTag::ExpBan),
        vec!["1 banned by lurker".to_string()]
    );
    assert_eq!(c.expire(), vec![1]);
    assert_eq!(c.bans().stats().snapshot().bans_lurker_obj_killed, 1);

    // Object 2 still pins the baseline.
    assert_eq!(c.reap().removed, 0);
    assert_eq!(c.lookup(2), CheckOutcome::Fresh);
    assert_eq!(c.bans().ban_of(2), Some(b2));

    let report = c.reap();
    assert_eq!(report.removed, 2);
    assert!(c.bans().ban(b1).is_none());
    assert_eq!(c.bans().ids_newest_first(), vec![b2]);
}

// ════════════════════════════════════════════════════════════════
// SCENARIO B: dismantling under the lurker's feet
// ════════════════════════════════════════════════════════════════

#[test]
fn acquirer_makes_progress_while_domain_is_dismantled() {
    let mut c = Cache::new();
    let head = ObjHead::new("/shared");
    let o1 = c.object(&head, 1, "a");
    let o2 = c.object(&head, 2, "b");
    c.ban("never");
    c.resident.clear();

    let guard = head.lock();
    let c = &c;
    thread::scope(|s| {
        let pass = s.spawn(move || c.pass(params(0.0, 0)));

        let deadline = Instant::now() + Duration::from_secs(10);
        while c.bans().stats().snapshot().bans_lurker_contention == 0 {
            assert!(Instant::now() < deadline, "lurker never hit the held domain");
            thread::sleep(Duration::from_millis(1));
        }
        drop(guard);
        for oc in [&o1, &o2] {
            deref_objcore(c.bans(), oc);
        }

        let out = pass.join().unwrap();
        assert_eq!(
            out,
            PassOutcome::Done {
                completed: 1,
                killed: 0
            }
        );
    });

    assert_eq!(c.bans().tracked_objects(), 0);
    assert!(head.lock().is_empty());
    assert_eq!(c.bans().markers_in_queues(), 0);
    assert_eq!(c.bans().stats().snapshot().bans_lurker_aborted, 0);
}

// ════════════════════════════════════════════════════════════════
// SCENARIO C: referenced tail
// ════════════════════════════════════════════════════════════════

#[test]
fn referenced_tail_survives_until_released() {
    let c = Cache::new();
    let base = c.bans().newest();
    let hold = c.bans().hold(base).unwrap();
    c.ban("x");

    assert_eq!(c.reap().removed, 0);
    assert_eq!(c.bans().len(), 2);

    let before = c.bans().stats().snapshot();
    drop(hold);
    let report = c.reap();
    assert_eq!(report.removed, 1);
    assert!(c.bans().ban(base).is_none());

    let after = c.bans().stats().snapshot();
    assert_eq!(after.bans, before.bans - 1);
    assert_eq!(after.bans_deleted, before.bans_deleted + 1);
    // The baseline is born completed.
    assert_eq!(after.bans_completed, before.bans_completed - 1);
    assert_eq!(after.bans_obj, before.bans_obj);
    assert_eq!(after.bans_req, before.bans_req);

    assert_eq!(c.reap().removed, 0);
    assert_eq!(c.bans().stats().snapshot(), after);
}

// ════════════════════════════════════════════════════════════════
// PROPERTIES
// ════════════════════════════════════════════════════════════════

#[test]
fn completed_never_reverts() {
    let mut c = Cache::new();
    c.solo(1, "keep");
    let b1 = c.ban("gone");
    c.ban("other");
    c.pass(params(0.0, 0));
    assert!(c.bans().ban(b1).unwrap().is_completed());

    for round in 0..5u64 {
        c.solo(100 + round, "gone");
        c.ban(&format!("r{round}"));
        c.pass(params(0.0, 0));
        c.expire();
        assert!(c.bans().ban(b1).unwrap().is_completed());
    }
    // A fresh duplicate of a completed predicate is not a dup.
    c.ban("gone");
    assert!(c.bans().ban(b1).unwrap().is_completed());
    assert_eq!(c.bans().stats().snapshot().bans_dups, 0);
}

#[test]
fn second_pass_without_new_bans_changes_nothing() {
    let mut c = Cache::new();
    for xid in 0..8 {
        c.solo(xid, if xid % 2 == 0 { "even" } else { "odd" });
    }
    c.ban("odd");
    c.ban("none");
    assert!(c.pass(params(0.0, 0)).did_work());
    c.expire();

    let ids = c.bans().ids_newest_first();
    let homes: Vec<_> = (0..8).map(|x| c.bans().ban_of(x)).collect();
    let tested = c.bans().stats().snapshot().bans_lurker_tested;

    assert_eq!(c.pass(params(0.0, 0)), PassOutcome::NoWork);
    assert_eq!(c.bans().ids_newest_first(), ids);
    assert_eq!((0..8).map(|x| c.bans().ban_of(x)).collect::<Vec<_>>(), homes);
    assert_eq!(c.bans().stats().snapshot().bans_lurker_tested, tested);
}

#[test]
fn request_scoped_bans_are_left_to_lookups() {
    let mut c = Cache::new();
    c.solo(1, "x");
    let req = c.bans().insert(url_ban(c.now(), "^/obj/"));
    c.ban("y");
    c.pass(params(0.0, 0));
    assert!(!c.bans().ban(req).unwrap().is_completed());
    assert!(c.expire().is_empty());
}

#[test]
fn marker_never_outlives_a_pass() {
    let mut c = Cache::new();
    let shared = ObjHead::new("/m");
    for xid in 0..6 {
        c.object(&shared, xid, "t");
    }
    c.ban("u");
    c.pass(params(0.0, 0));
    assert_eq!(c.bans().markers_in_queues(), 0);

    c.ban("t");
    {
        let _held = shared.lock();
        assert!(matches!(c.pass(params(0.0, 1)), PassOutcome::Aborted { .. }));
    }
    assert_eq!(c.bans().markers_in_queues(), 0);

    assert!(matches!(c.pass(params(0.0, 1)), PassOutcome::Done { killed: 6, .. }));
    assert_eq!(c.bans().markers_in_queues(), 0);
    assert_eq!(c.expire().len(), 6);
}

#[test]
fn counters_match_the_list_after_many_rounds() {
    let mut c = Cache::new();
    let mut next_xid = 0;
    let mut removed = 0;
    let mut holds = Vec::new();

    for round in 0..6u32 {
        for _ in 0..10 {
            c.solo(next_xid, &format!("t{}", next_xid % 5));
            next_xid += 1;
        }
        c.ban(&format!("t{}", round % 5));
        c.bans().insert(url_ban(c.now(), "^/never/"));
        if round % 3 == 0 {
            holds.push(c.bans().hold_newest());
        }
        c.advance(30);
        c.ban(&format!("t{}", (round + 2) % 5));

        c.pass(params(20.0, 0));
        c.expire();
        let xids: Vec<_> = c.resident.keys().copied().collect();
        for xid in xids {
            c.lookup(xid);
        }
        removed += c.reap().removed;
    }
    drop(holds);
    removed += c.reap().removed;

    let snap = c.bans().stats().snapshot();
    let ids = c.bans().ids_newest_first();
    assert_eq!(snap.bans as usize, ids.len());
    assert_eq!(snap.bans_added, snap.bans_deleted + ids.len() as u64);
    assert_eq!(snap.bans_deleted, removed as u64);

    let count = |flag: BanFlags| {
        ids.iter()
            .filter(|id| c.bans().ban(**id).unwrap().flags().contains(flag))
            .count() as u64
    };
    assert_eq!(snap.bans_completed, count(BanFlags::COMPLETED));
    assert_eq!(snap.bans_obj, count(BanFlags::OBJ));
    assert_eq!(snap.bans_req, count(BanFlags::REQ));

    // Every object has been looked up since the last insert, so only the
    // newest ban is referenced and everything older is gone.
    assert_eq!(ids.len(), 1);
    assert!(c.resident.keys().all(|x| c.bans().ban_of(*x) == Some(ids[0])));
}

// ════════════════════════════════════════════════════════════════
// THREADED
// ════════════════════════════════════════════════════════════════

#[test]
fn kick_wakes_a_lurker_on_a_long_cadence() {
    let mut c = Cache::new();
    c.solo(1, "a");
    c.solo(2, "b");
    let sink = Arc::new(MemorySink::new());
    let mut cfg = common::lurker_config(0.0, 0);
    cfg.sleep_secs = 3600.0;
    let handle = spawn_lurker(c.deps.clone(), Arc::new(LurkerParams::new(&cfg)), sink).unwrap();

    let wait_completed = |id| {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !c.bans().ban(id).is_some_and(|b| b.is_completed()) {
            assert!(Instant::now() < deadline, "{id} never completed");
            thread::sleep(Duration::from_millis(2));
        }
    };

    // Insertion wakes the lurker.
    let first = c.ban("a");
    wait_completed(first);
    let note = c
        .expiry_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("object 1 rearmed");
    assert_eq!(note.object.xid(), 1);

    // Now on the hour-long cadence; the next insert's wake-up is the only way in.
    let second = c.ban("b");
    wait_completed(second);

    let exit = handle.join().unwrap();
    assert!(exit.passes >= 2);
    assert_eq!(c.bans().markers_in_queues(), 0);
}
