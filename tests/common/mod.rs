#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ban_lurker::ban::evaluate::HeaderEvaluator;
use ban_lurker::ban::list::{BanId, BanList, CheckOutcome};
use ban_lurker::ban::spec::{BanField, BanOp, BanSpec, BanTest};
use ban_lurker::core::clock::ManualClock;
use ban_lurker::core::config::{LurkerConfig, LurkerParams, ParamSnapshot};
use ban_lurker::logger::trace::{MemorySink, TraceBuffer};
use ban_lurker::lurker::LurkerDeps;
use ban_lurker::lurker::planner::{PassOutcome, PassPlanner};
use ban_lurker::lurker::reaper::{ReapReport, TailReaper};
use ban_lurker::lurker::tester::BatchLimiter;
use ban_lurker::store::{Expiry, ExpiryInbox, ObjCore, ObjHead, Rearmed, Xid, deref_objcore};
use crossbeam_channel::Receiver;

pub const TAG: &str = "x-tag";

pub fn t0() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

pub fn tag_ban(created: SystemTime, tag: &str) -> BanSpec {
    BanSpec::new(
        created,
        vec![BanTest::new(BanField::ObjHeader(TAG.to_string()), BanOp::Eq, tag).unwrap()],
    )
    .unwrap()
}

pub fn url_ban(created: SystemTime, pattern: &str) -> BanSpec {
    BanSpec::new(
        created,
        vec![BanTest::new(BanField::ReqUrl, BanOp::Match, pattern).unwrap()],
    )
    .unwrap()
}

pub fn params(age_secs: f64, retry_limit: u32) -> ParamSnapshot {
    LurkerParams::new(&lurker_config(age_secs, retry_limit)).snapshot()
}

pub fn lurker_config(age_secs: f64, retry_limit: u32) -> LurkerConfig {
    LurkerConfig {
        sleep_secs: 0.001,
        backoff_secs: 0.001,
        batch: 10_000,
        age_secs,
        contention_retry_limit: retry_limit,
        debug: false,
    }
}

/// A single-threaded stand-in for the cache: owns one reference on every
/// resident object and plays the expiry pipeline on demand.
pub struct Cache {
    pub clock: Arc<ManualClock>,
    pub deps: LurkerDeps,
    pub expiry_rx: Receiver<Rearmed>,
    pub resident: HashMap<Xid, Arc<ObjCore>>,
    pub trace: Arc<MemorySink>,
}

impl Cache {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let (expiry, expiry_rx) = ExpiryInbox::channel();
        let deps = LurkerDeps {
            bans: Arc::new(BanList::new(t0())),
            evaluator: Arc::new(HeaderEvaluator),
            expiry,
            clock: clock.clone(),
        };
        Self {
            clock,
            deps,
            expiry_rx,
            resident: HashMap::new(),
            trace: Arc::new(MemorySink::new()),
        }
    }

    pub fn bans(&self) -> &Arc<BanList> {
        &self.deps.bans
    }

    pub fn now(&self) -> SystemTime {
        use ban_lurker::core::clock::Clock;
        self.clock.now()
    }

    pub fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    /// Cache an object under `head` and enroll it under the newest ban.
    pub fn object(&mut self, head: &Arc<ObjHead>, xid: Xid, tag: &str) -> Arc<ObjCore> {
        let mut headers = HashMap::new();
        headers.insert(TAG.to_string(), tag.to_string());
        let oc = ObjCore::insert(head, xid, headers, Expiry::new(self.now(), Duration::from_secs(3600)));
        self.bans().attach(&oc);
        self.resident.insert(xid, Arc::clone(&oc));
        oc
    }

    /// Same, with a head of its own.
    pub fn solo(&mut self, xid: Xid, tag: &str) -> Arc<ObjCore> {
        let head = ObjHead::new(format!("/obj/{xid}"));
        self.object(&head, xid, tag)
    }

    pub fn ban(&self, tag: &str) -> BanId {
        self.bans().insert(tag_ban(self.now(), tag))
    }

    pub fn pass(&self, params: ParamSnapshot) -> PassOutcome {
        let mut trace = TraceBuffer::new(self.trace.clone());
        PassPlanner::new(&self.deps, params).run(&mut BatchLimiter::new(), &mut trace)
    }

    pub fn reap(&self) -> ReapReport {
        let mut trace = TraceBuffer::new(self.trace.clone());
        TailReaper::new(self.bans()).reap(&mut trace)
    }

    /// Run the expiry pipeline: drop the cache's reference on every
    /// rearmed object. Returns the xids removed.
    pub fn expire(&mut self) -> Vec<Xid> {
        let mut out = Vec::new();
        while let Ok(note) = self.expiry_rx.try_recv() {
            let xid = note.object.xid();
            if let Some(oc) = self.resident.remove(&xid) {
                deref_objcore(self.bans(), &oc);
                out.push(xid);
            }
        }
        out.sort_unstable();
        out
    }

    /// Request-path lookup; a banned object is evicted.
    pub fn lookup(&mut self, xid: Xid) -> CheckOutcome {
        let Some(oc) = self.resident.get(&xid).cloned() else {
            return CheckOutcome::NotTracked;
        };
        let outcome = {
            let mut head = oc.head().lock();
            oc.add_ref_locked(&mut head);
            self.bans().check_object(&oc, None, &HeaderEvaluator)
        };
        if outcome == CheckOutcome::Banned {
            self.resident.remove(&xid);
            deref_objcore(self.bans(), &oc);
        }
        deref_objcore(self.bans(), &oc);
        outcome
    }
}

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_lurker") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "lurker.exe" } else { "lurker" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve lurker binary path for integration test"),
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str], envs: &[(&str, &str)]) -> CmdResult {
    let root = std::env::temp_dir().join("lurker-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .envs(envs.iter().copied())
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute lurker command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}
