//! Soak driver: a synthetic cache exercising the lurker under load.
//!
//! Resident objects are spread over a small number of object heads so the
//! lurker's inverted-order `try_lock` regularly loses to request threads that
//! take the head lock first and the ban lock second. A producer inserts bans
//! at a fixed interval and tops the object population back up. Rearmed
//! objects are removed by an expiry thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::ban::evaluate::{HeaderEvaluator, RequestContext};
use crate::ban::list::{BanList, CheckOutcome};
use crate::ban::spec::{BanField, BanOp, BanSpec, BanTest};
use crate::ban::stats::BanStatsSnapshot;
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::{Config, LurkerParams};
use crate::core::errors::{LurkerError, Result};
use crate::daemon::signals::SignalHandler;
use crate::logger::handle::spawn_trace_logger;
use crate::lurker::LurkerDeps;
use crate::lurker::scheduler::{LurkerExit, LurkerHandle, spawn_lurker};
use crate::store::{Expiry, ExpiryInbox, ObjCore, ObjHead, Rearmed, Xid, deref_objcore};

const TAG_HEADER: &str = "x-tag";

/// Workload shape.
#[derive(Debug, Clone)]
pub struct SoakOptions {
    /// Wall-clock length of the run.
    pub duration: Duration,
    /// Resident population the producer maintains.
    pub objects: usize,
    /// Objects per object head.
    pub variants_per_head: usize,
    /// Concurrent lookup threads.
    pub request_threads: usize,
    /// Pause between ban insertions.
    pub ban_interval: Duration,
    /// Distinct tag values bans and objects draw from.
    pub tags: u32,
    /// Seed for every RNG in the run.
    pub seed: u64,
}

impl Default for SoakOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            objects: 10_000,
            variants_per_head: 4,
            request_threads: 4,
            ban_interval: Duration::from_millis(50),
            tags: 64,
            seed: 0x5eed,
        }
    }
}

/// Final numbers, printed as JSON by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SoakReport {
    /// Actual run time, shutdown included.
    pub elapsed_secs: f64,
    /// Lurker thread exit counters.
    pub lurker: LurkerExit,
    /// Ban counters at the end of the run.
    pub bans: BanStatsSnapshot,
    /// Bans still on the list.
    pub ban_list_len: usize,
    /// Objects still cached.
    pub resident_objects: usize,
    /// Lookups served.
    pub requests: u64,
    /// Objects evicted by a lookup-time ban check.
    pub banned_on_lookup: u64,
    /// Objects evicted by the expiry thread after a lurker rearm.
    pub expired: u64,
    /// Trace records lost to logger back-pressure.
    pub trace_records_dropped: u64,
}

/// Objects the synthetic cache still owns a reference to.
///
/// Whoever removes an object from this map drops the cache's reference.
#[derive(Debug, Default)]
struct Resident {
    objects: Mutex<HashMap<Xid, Arc<ObjCore>>>,
}

impl Resident {
    fn evict(&self, bans: &BanList, xid: Xid) -> bool {
        let removed = self.objects.lock().remove(&xid);
        removed.is_some_and(|oc| {
            deref_objcore(bans, &oc);
            true
        })
    }

    fn pick(&self, rng: &mut StdRng, max_xid: Xid) -> Option<Arc<ObjCore>> {
        let xid = rng.random_range(0..max_xid.max(1));
        self.objects.lock().get(&xid).cloned()
    }

    fn len(&self) -> usize {
        self.objects.lock().len()
    }
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    banned_on_lookup: AtomicU64,
    expired: AtomicU64,
}

/// Drives one soak run against a live lurker.
pub struct SoakRunner {
    config: Config,
    options: SoakOptions,
    signals: SignalHandler,
}

impl SoakRunner {
    /// Runner for `options`, with the lurker tuned by `config`.
    #[must_use]
    pub fn new(config: Config, options: SoakOptions, signals: SignalHandler) -> Self {
        Self {
            config,
            options,
            signals,
        }
    }

    /// Run until the duration elapses or shutdown is signalled.
    #[allow(clippy::too_many_lines)]
    pub fn run(&mut self) -> Result<SoakReport> {
        let start = Instant::now();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let bans = Arc::new(BanList::new(clock.now()));
        let (expiry, expiry_rx) = ExpiryInbox::channel();
        let (trace, trace_join) = spawn_trace_logger(&self.config.trace)?;
        let params = Arc::new(LurkerParams::new(&self.config.lurker));

        let deps = LurkerDeps {
            bans: Arc::clone(&bans),
            evaluator: Arc::new(HeaderEvaluator),
            expiry,
            clock: Arc::clone(&clock),
        };
        let lurker = spawn_lurker(deps, Arc::clone(&params), Arc::new(trace.clone()))?;
        eprintln!(
            "[LRK-SOAK] started: objects={} request_threads={} ban_interval={:?}",
            self.options.objects, self.options.request_threads, self.options.ban_interval
        );

        let resident = Arc::new(Resident::default());
        let counters = Arc::new(Counters::default());
        let stop = Arc::new(AtomicBool::new(false));
        let next_xid = Arc::new(AtomicU64::new(0));
        let mut rng = StdRng::seed_from_u64(self.options.seed);
        let mut heads: Vec<Arc<ObjHead>> = Vec::new();

        self.refill(&bans, &resident, &next_xid, &mut heads, &mut rng, clock.as_ref());

        let mut workers = Vec::new();
        for i in 0..self.options.request_threads {
            let ctx = RequestCtx {
                bans: Arc::clone(&bans),
                resident: Arc::clone(&resident),
                counters: Arc::clone(&counters),
                stop: Arc::clone(&stop),
                next_xid: Arc::clone(&next_xid),
                seed: self.options.seed.wrapping_add(i as u64 + 1),
            };
            let join = thread::Builder::new()
                .name(format!("soak-req-{i}"))
                .spawn(move || ctx.run())
                .map_err(|e| LurkerError::Runtime {
                    details: format!("failed to spawn request thread: {e}"),
                })?;
            workers.push(join);
        }

        let expiry_join = {
            let bans = Arc::clone(&bans);
            let resident = Arc::clone(&resident);
            let counters = Arc::clone(&counters);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("soak-expiry".to_string())
                .spawn(move || expiry_main(&expiry_rx, &bans, &resident, &counters, &stop))
                .map_err(|e| LurkerError::Runtime {
                    details: format!("failed to spawn expiry thread: {e}"),
                })?
        };

        let deadline = start + self.options.duration;
        let mut next_ban = Instant::now();
        while Instant::now() < deadline {
            if self.signals.should_shutdown() {
                eprintln!("[LRK-SOAK] shutdown requested");
                break;
            }
            if self.signals.should_kick() {
                lurker.kick();
            }
            if self.signals.should_reload() {
                self.reload(&lurker);
            }
            if Instant::now() >= next_ban {
                let tag = rng.random_range(0..self.options.tags.max(1));
                bans.insert(tag_ban(clock.now(), tag)?);
                self.refill(&bans, &resident, &next_xid, &mut heads, &mut rng, clock.as_ref());
                next_ban += self.options.ban_interval;
            }
            thread::sleep(Duration::from_millis(5));
        }

        stop.store(true, Ordering::Release);
        for join in workers {
            let _ = join.join();
        }
        let _ = expiry_join.join();
        let lurker_exit = lurker.join()?;

        let report = SoakReport {
            elapsed_secs: start.elapsed().as_secs_f64(),
            lurker: lurker_exit,
            bans: bans.stats().snapshot(),
            ban_list_len: bans.len(),
            resident_objects: resident.len(),
            requests: counters.requests.load(Ordering::Relaxed),
            banned_on_lookup: counters.banned_on_lookup.load(Ordering::Relaxed),
            expired: counters.expired.load(Ordering::Relaxed),
            trace_records_dropped: trace.dropped_records(),
        };
        trace.shutdown();
        let _ = trace_join.join();
        Ok(report)
    }

    fn refill(
        &self,
        bans: &BanList,
        resident: &Resident,
        next_xid: &AtomicU64,
        heads: &mut Vec<Arc<ObjHead>>,
        rng: &mut StdRng,
        clock: &dyn Clock,
    ) {
        let per_head = self.options.variants_per_head.max(1);
        while resident.len() < self.options.objects {
            let xid = next_xid.fetch_add(1, Ordering::Relaxed);
            let slot = usize::try_from(xid).unwrap_or(usize::MAX) / per_head;
            if slot >= heads.len() {
                heads.push(ObjHead::new(format!("/soak/{slot}")));
            }
            let head = &heads[heads.len() - 1];
            let mut headers = HashMap::new();
            let tag = rng.random_range(0..self.options.tags.max(1));
            headers.insert(TAG_HEADER.to_string(), format!("t{tag}"));
            let oc = ObjCore::insert(head, xid, headers, Expiry::new(clock.now(), Duration::from_secs(3600)));
            bans.attach(&oc);
            resident.objects.lock().insert(xid, oc);
        }
    }

    fn reload(&mut self, lurker: &LurkerHandle) {
        eprintln!("[LRK-SOAK] config reload requested (SIGHUP)");
        match Config::load(self.config.config_file.as_deref()) {
            Ok(new_config) => {
                let old_hash = self.config.stable_hash().unwrap_or_default();
                let new_hash = new_config.stable_hash().unwrap_or_default();
                if old_hash == new_hash {
                    eprintln!("[LRK-SOAK] config unchanged, skipping reload");
                    return;
                }
                match lurker.update_params(&new_config.lurker) {
                    Ok(()) => {
                        eprintln!("[LRK-SOAK] config reloaded: {old_hash} -> {new_hash}");
                        self.config = new_config;
                    }
                    Err(e) => eprintln!("[LRK-SOAK] config reload rejected: {e}"),
                }
            }
            Err(e) => eprintln!("[LRK-SOAK] config reload failed: {e}"),
        }
    }
}

fn tag_ban(now: SystemTime, tag: u32) -> Result<BanSpec> {
    BanSpec::new(
        now,
        vec![BanTest::new(
            BanField::ObjHeader(TAG_HEADER.to_string()),
            BanOp::Eq,
            format!("t{tag}"),
        )?],
    )
}

struct RequestCtx {
    bans: Arc<BanList>,
    resident: Arc<Resident>,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
    next_xid: Arc<AtomicU64>,
    seed: u64,
}

impl RequestCtx {
    fn run(&self) {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let evaluator = HeaderEvaluator;
        while !self.stop.load(Ordering::Acquire) {
            let Some(oc) = self
                .resident
                .pick(&mut rng, self.next_xid.load(Ordering::Relaxed))
            else {
                thread::yield_now();
                continue;
            };
            self.counters.requests.fetch_add(1, Ordering::Relaxed);

            let req = RequestContext {
                url: oc.head().key().to_string(),
                host: None,
            };
            // Lookup: the ban check runs under the head lock, so the ban lock nests inside it.
            let outcome = {
                let mut head = oc.head().lock();
                if head.refcnt(oc.xid()) == 0 {
                    None
                } else {
                    oc.add_ref_locked(&mut head);
                    Some(self.bans.check_object(&oc, Some(&req), &evaluator))
                }
            };
            let Some(outcome) = outcome else {
                continue;
            };
            if outcome == CheckOutcome::Banned {
                self.counters.banned_on_lookup.fetch_add(1, Ordering::Relaxed);
                self.resident.evict(&self.bans, oc.xid());
            }
            deref_objcore(&self.bans, &oc);
        }
    }
}

fn expiry_main(
    rx: &Receiver<Rearmed>,
    bans: &BanList,
    resident: &Resident,
    counters: &Counters,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Acquire) {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(note) => {
                if resident.evict(bans, note.object.xid()) {
                    counters.expired.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_soak_makes_progress() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.trace.jsonl_path = dir.path().join("trace.jsonl");
        config.lurker.age_secs = 0.0;
        config.lurker.sleep_secs = 0.001;
        config.lurker.backoff_secs = 0.0005;
        let options = SoakOptions {
            duration: Duration::from_millis(400),
            objects: 200,
            variants_per_head: 4,
            request_threads: 2,
            ban_interval: Duration::from_millis(20),
            tags: 8,
            seed: 7,
        };
        let report = SoakRunner::new(config, options, SignalHandler::unregistered())
            .run()
            .unwrap();
        assert!(report.lurker.cycles >= 1);
        assert!(report.bans.bans_added > 1);
        assert!(report.ban_list_len >= 1);
        assert_eq!(report.bans.bans as usize, report.ban_list_len);
    }

    #[test]
    fn shutdown_flag_ends_early() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.trace.jsonl_path = dir.path().join("trace.jsonl");
        let signals = SignalHandler::unregistered();
        signals.request_shutdown();
        let options = SoakOptions {
            duration: Duration::from_secs(30),
            objects: 10,
            request_threads: 1,
            ..SoakOptions::default()
        };
        let started = Instant::now();
        SoakRunner::new(config, options, signals).run().unwrap();
        assert!(started.elapsed() < Duration::from_secs(20));
    }
}
