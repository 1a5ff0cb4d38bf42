//! Configuration system: TOML file + env var overrides + defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{LurkerError, Result};

/// Full lurker configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub lurker: LurkerConfig,
    pub trace: TraceConfig,
    /// Path this config was loaded from (not serialized).
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

/// Lurker tunables. All of them are re-read at the top of every cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LurkerConfig {
    /// Cadence between passes, and the batch pause. `<= 0` idles the lurker.
    pub sleep_secs: f64,
    /// Backoff after failing to take an object's lock domain.
    pub backoff_secs: f64,
    /// Objects processed before the lurker pauses for `sleep_secs`.
    pub batch: u32,
    /// Bans younger than this are not lazily tested.
    pub age_secs: f64,
    /// Maximum backoffs per acquisition before the pass is abandoned (0 = unlimited).
    pub contention_retry_limit: u32,
    /// Emit debug trace records for each pass.
    pub debug: bool,
}

/// Trace (JSONL) sink settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TraceConfig {
    pub jsonl_path: PathBuf,
    pub fallback_path: Option<PathBuf>,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
    pub fsync_interval_secs: u64,
    pub channel_capacity: usize,
}

impl Default for LurkerConfig {
    fn default() -> Self {
        Self {
            sleep_secs: 0.010,
            backoff_secs: 0.010,
            batch: 1000,
            age_secs: 60.0,
            contention_retry_limit: 0,
            debug: false,
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[LRK-CONFIG] WARNING: HOME not set, falling back to /tmp for trace paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let data = home_dir.join(".local").join("share").join("lurker");
        Self {
            jsonl_path: data.join("trace.jsonl"),
            fallback_path: None,
            max_size_bytes: 50 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval_secs: 30,
            channel_capacity: 1024,
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        env::var_os("HOME")
            .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
            .join(".config")
            .join("lurker")
            .join("config.toml")
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| LurkerError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(LurkerError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.config_file = Some(path_buf);
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the canonical JSON so the value is stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    /// Render the effective config as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| LurkerError::Serialization {
            context: "toml",
            details: e.to_string(),
        })
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("LURKER_SLEEP_SECS") {
            self.lurker.sleep_secs = parse_env("LURKER_SLEEP_SECS", &raw)?;
        }
        if let Some(raw) = lookup("LURKER_BACKOFF_SECS") {
            self.lurker.backoff_secs = parse_env("LURKER_BACKOFF_SECS", &raw)?;
        }
        if let Some(raw) = lookup("LURKER_BATCH") {
            self.lurker.batch = parse_env("LURKER_BATCH", &raw)?;
        }
        if let Some(raw) = lookup("LURKER_AGE_SECS") {
            self.lurker.age_secs = parse_env("LURKER_AGE_SECS", &raw)?;
        }
        if let Some(raw) = lookup("LURKER_CONTENTION_RETRY_LIMIT") {
            self.lurker.contention_retry_limit =
                parse_env("LURKER_CONTENTION_RETRY_LIMIT", &raw)?;
        }
        if let Some(raw) = lookup("LURKER_DEBUG") {
            self.lurker.debug = parse_env("LURKER_DEBUG", &raw)?;
        }
        if let Some(raw) = lookup("LURKER_TRACE_JSONL_PATH") {
            self.trace.jsonl_path = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("LURKER_TRACE_CHANNEL_CAPACITY") {
            self.trace.channel_capacity = parse_env("LURKER_TRACE_CHANNEL_CAPACITY", &raw)?;
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.lurker.validate()?;

        if self.trace.channel_capacity == 0 {
            return Err(LurkerError::InvalidConfig {
                details: "trace.channel_capacity must be >= 1".to_string(),
            });
        }
        if self.trace.max_size_bytes == 0 {
            return Err(LurkerError::InvalidConfig {
                details: "trace.max_size_bytes must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Longest interval any lurker knob may ask for, about 31 years.
pub const MAX_INTERVAL_SECS: f64 = 1e9;

impl LurkerConfig {
    /// Check the tunables before they reach a running lurker.
    pub fn validate(&self) -> Result<()> {
        for (name, val) in [
            ("sleep_secs", self.sleep_secs),
            ("backoff_secs", self.backoff_secs),
            ("age_secs", self.age_secs),
        ] {
            if !val.is_finite() {
                return Err(LurkerError::InvalidConfig {
                    details: format!("lurker.{name} must be finite, got {val}"),
                });
            }
            if val > MAX_INTERVAL_SECS {
                return Err(LurkerError::InvalidConfig {
                    details: format!("lurker.{name} must be <= {MAX_INTERVAL_SECS}, got {val}"),
                });
            }
        }
        // A non-positive cadence is legal: it parks the lurker on the idle interval.
        if self.backoff_secs < 0.0 || self.age_secs < 0.0 {
            return Err(LurkerError::InvalidConfig {
                details: "lurker.backoff_secs and lurker.age_secs must be >= 0".to_string(),
            });
        }
        if self.batch == 0 {
            return Err(LurkerError::InvalidConfig {
                details: "lurker.batch must be >= 1".to_string(),
            });
        }
        Ok(())
    }
}

// ──────────────────── live parameters ────────────────────

/// Lurker tunables shared with the running thread via atomics.
///
/// f64 values are stored as their bit patterns.
#[derive(Debug)]
pub struct LurkerParams {
    sleep_bits: AtomicU64,
    backoff_bits: AtomicU64,
    age_bits: AtomicU64,
    batch: AtomicU32,
    retry_limit: AtomicU32,
    debug: AtomicBool,
}

/// One consistent read of [`LurkerParams`], taken at the top of a cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSnapshot {
    pub sleep_secs: f64,
    pub backoff_secs: f64,
    pub age_secs: f64,
    pub batch: u32,
    pub contention_retry_limit: u32,
    pub debug: bool,
}

impl LurkerParams {
    #[must_use]
    pub fn new(cfg: &LurkerConfig) -> Self {
        Self {
            sleep_bits: AtomicU64::new(cfg.sleep_secs.to_bits()),
            backoff_bits: AtomicU64::new(cfg.backoff_secs.to_bits()),
            age_bits: AtomicU64::new(cfg.age_secs.to_bits()),
            batch: AtomicU32::new(cfg.batch),
            retry_limit: AtomicU32::new(cfg.contention_retry_limit),
            debug: AtomicBool::new(cfg.debug),
        }
    }

    /// Replace every knob. Callers validate first.
    pub fn store(&self, cfg: &LurkerConfig) {
        self.sleep_bits
            .store(cfg.sleep_secs.to_bits(), Ordering::Relaxed);
        self.backoff_bits
            .store(cfg.backoff_secs.to_bits(), Ordering::Relaxed);
        self.age_bits.store(cfg.age_secs.to_bits(), Ordering::Relaxed);
        self.batch.store(cfg.batch, Ordering::Relaxed);
        self.retry_limit
            .store(cfg.contention_retry_limit, Ordering::Relaxed);
        self.debug.store(cfg.debug, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ParamSnapshot {
        ParamSnapshot {
            sleep_secs: f64::from_bits(self.sleep_bits.load(Ordering::Relaxed)),
            backoff_secs: f64::from_bits(self.backoff_bits.load(Ordering::Relaxed)),
            age_secs: f64::from_bits(self.age_bits.load(Ordering::Relaxed)),
            batch: self.batch.load(Ordering::Relaxed),
            contention_retry_limit: self.retry_limit.load(Ordering::Relaxed),
            debug: self.debug.load(Ordering::Relaxed),
        }
    }
}

impl ParamSnapshot {
    /// Cadence as a sleepable duration; `None` when the lurker should idle.
    #[must_use]
    pub fn cadence(&self) -> Option<Duration> {
        (self.sleep_secs > 0.0).then(|| interval(self.sleep_secs))
    }

    #[must_use]
    pub fn backoff(&self) -> Duration {
        interval(self.backoff_secs)
    }

    /// Pause taken when the batch limiter trips.
    #[must_use]
    pub fn batch_pause(&self) -> Duration {
        interval(self.sleep_secs)
    }

    #[must_use]
    pub fn min_age(&self) -> Duration {
        interval(self.age_secs)
    }
}

/// Seconds to a duration, clamped to `[0, Duration::MAX]`. Unvalidated
/// params can reach here through [`LurkerParams::new`].
fn interval(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|error| LurkerError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}
