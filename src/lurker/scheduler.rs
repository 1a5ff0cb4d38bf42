//! The lurker thread.
//!
//! ```text
//!   loop until shutdown:
//!     snapshot params + wake generation
//!     pass (skipped while the cadence is <= 0)
//!     reap tail
//!     wait for kick or deadline (cadence, or IDLE_INTERVAL with nothing done)
//! ```
//!
//! Shutdown is only observed at the top of a cycle. A running pass always
//! finishes first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::config::{LurkerConfig, LurkerParams};
use crate::core::errors::{LurkerError, Result};
use crate::logger::trace::{TraceBuffer, TraceSink, TraceTag};
use crate::lurker::planner::{PassOutcome, PassPlanner};
use crate::lurker::reaper::{ReapReport, TailReaper};
use crate::lurker::tester::BatchLimiter;
use crate::lurker::{IDLE_INTERVAL, LurkerDeps};

/// Ceiling on one wait when the cadence overflows an `Instant`.
const MAX_WAIT: Duration = Duration::from_secs(1_000_000_000);

/// What one cycle did, and how long it wants to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Pass result.
    pub pass: PassOutcome,
    /// Tail reap result.
    pub reaped: ReapReport,
    /// Wait before the next cycle, absent a kick.
    pub wait: Duration,
}

/// Exit status of the lurker thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LurkerExit {
    /// Cycles run.
    pub cycles: u64,
    /// Cycles whose pass found work.
    pub passes: u64,
    /// Bans removed from the tail.
    pub bans_reaped: u64,
}

/// The lurker's worker context.
#[derive(Debug)]
pub struct BanLurker {
    deps: LurkerDeps,
    params: Arc<LurkerParams>,
    shutdown: Arc<AtomicBool>,
    trace: TraceBuffer,
    limiter: BatchLimiter,
    exit: LurkerExit,
}

impl BanLurker {
    /// Lurker over `deps`, reading live tunables from `params`.
    #[must_use]
    pub fn new(deps: LurkerDeps, params: Arc<LurkerParams>, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            deps,
            params,
            shutdown: Arc::new(AtomicBool::new(false)),
            trace: TraceBuffer::new(sink),
            limiter: BatchLimiter::new(),
            exit: LurkerExit::default(),
        }
    }

    /// Flag observed at the top of every cycle.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run one cycle without waiting.
    pub fn cycle(&mut self) -> CycleReport {
        let params = self.params.snapshot();
        self.trace.set_debug(params.debug);

        let pass = match params.cadence() {
            Some(_) => PassPlanner::new(&self.deps, params).run(&mut self.limiter, &mut self.trace),
            None => PassOutcome::NoWork,
        };
        let reaped = TailReaper::new(&self.deps.bans).reap(&mut self.trace);
        self.trace.flush();

        let wait = match (params.cadence(), pass.did_work()) {
            (Some(cadence), true) => cadence,
            _ => IDLE_INTERVAL,
        };

        self.exit.cycles += 1;
        if pass.did_work() {
            self.exit.passes += 1;
        }
        self.exit.bans_reaped += reaped.removed as u64;
        CycleReport { pass, reaped, wait }
    }

    /// Thread body: cycle until shutdown is requested.
    pub fn run(mut self) -> LurkerExit {
        self.trace.info(TraceTag::LurkerStart, "ban lurker started");
        self.trace.flush();

        while !self.shutdown.load(Ordering::Acquire) {
            let seen = self.deps.bans.generation();
            let report = self.cycle();
            let now = Instant::now();
            let deadline = now
                .checked_add(report.wait)
                .unwrap_or_else(|| now + MAX_WAIT);
            self.deps.bans.wait_for_kick(seen, deadline);
        }

        let exit = self.exit;
        self.trace.info(
            TraceTag::LurkerStop,
            format!(
                "ban lurker stopped after {} cycles, {} passes",
                exit.cycles, exit.passes
            ),
        );
        self.trace.flush();
        exit
    }
}

/// Control handle for a spawned lurker thread.
#[derive(Debug)]
pub struct LurkerHandle {
    deps: LurkerDeps,
    params: Arc<LurkerParams>,
    shutdown: Arc<AtomicBool>,
    join: thread::JoinHandle<LurkerExit>,
}

impl LurkerHandle {
    /// Ask for an expedited cycle.
    pub fn kick(&self) {
        self.deps.bans.kick();
    }

    /// Swap in new tunables; picked up at the next cycle.
    pub fn update_params(&self, cfg: &LurkerConfig) -> Result<()> {
        cfg.validate()?;
        self.params.store(cfg);
        self.kick();
        Ok(())
    }

    /// Request shutdown. The current pass completes first.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.kick();
    }

    /// True once the thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request shutdown and wait for the thread.
    pub fn join(self) -> Result<LurkerExit> {
        self.shutdown();
        self.join.join().map_err(|_| LurkerError::Runtime {
            details: "ban lurker thread panicked".to_string(),
        })
    }
}

/// Start the `ban-lurker` thread.
pub fn spawn_lurker(
    deps: LurkerDeps,
    params: Arc<LurkerParams>,
    sink: Arc<dyn TraceSink>,
) -> Result<LurkerHandle> {
    let lurker = BanLurker::new(deps.clone(), Arc::clone(&params), sink);
    let shutdown = lurker.shutdown_flag();
    let join = thread::Builder::new()
        .name("ban-lurker".to_string())
        .spawn(move || lurker.run())
        .map_err(|e| LurkerError::Runtime {
            details: format!("failed to spawn ban lurker thread: {e}"),
        })?;
    Ok(LurkerHandle {
        deps,
        params,
        shutdown,
        join,
    })
}
