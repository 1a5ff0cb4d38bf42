//! Ban predicates: a list of field tests plus their immutable encoded blob.
//!
//! Blob layout (little endian):
//!
//! ```text
//! [0..8)   creation time, f64 seconds since the epoch
//! [8..12)  total blob length, u32
//! [12]     scope flags (HAS_OBJ_SCOPE / HAS_REQ_SCOPE)
//! [13..)   per test: field tag, op tag, name\0, arg\0
//! ```

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;

use crate::ban::record::BanFlags;
use crate::core::clock::epoch_secs;
use crate::core::errors::{LurkerError, Result};

/// Length of the blob header; also the reported length of a completed ban.
pub const BANS_HEAD_LEN: usize = 13;

const OFF_LENGTH: usize = 8;
const OFF_FLAGS: usize = 12;

/// What a test inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BanField {
    /// A response header stored with the object (`obj.http.<name>`).
    ObjHeader(String),
    /// The request URL. Only available on the request path.
    ReqUrl,
    /// The request Host header. Only available on the request path.
    ReqHost,
}

impl BanField {
    /// Request-scoped fields cannot be evaluated against a resident object alone.
    #[must_use]
    pub const fn is_request_scoped(&self) -> bool {
        matches!(self, Self::ReqUrl | Self::ReqHost)
    }

    const fn tag(&self) -> u8 {
        match self {
            Self::ObjHeader(_) => 1,
            Self::ReqUrl => 2,
            Self::ReqHost => 3,
        }
    }
}

impl fmt::Display for BanField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ObjHeader(name) => write!(f, "obj.http.{name}"),
            Self::ReqUrl => f.write_str("req.url"),
            Self::ReqHost => f.write_str("req.http.host"),
        }
    }
}

/// Comparison applied to the field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanOp {
    /// Equal to the argument.
    Eq,
    /// Not equal to the argument.
    Ne,
    /// Matches the argument as a regex.
    Match,
    /// Does not match the argument as a regex.
    NoMatch,
}

impl BanOp {
    const fn tag(self) -> u8 {
        match self {
            Self::Eq => 1,
            Self::Ne => 2,
            Self::Match => 3,
            Self::NoMatch => 4,
        }
    }

    const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Match => "~",
            Self::NoMatch => "!~",
        }
    }
}

/// One `field op arg` clause. A ban matches when all of its tests match.
#[derive(Debug, Clone)]
pub struct BanTest {
    /// Value under test.
    pub field: BanField,
    /// Comparison.
    pub op: BanOp,
    /// Literal or regex source, depending on `op`.
    pub arg: String,
    regex: Option<Regex>,
}

impl BanTest {
    /// Build a test, compiling the argument for the regex operators.
    pub fn new(field: BanField, op: BanOp, arg: impl Into<String>) -> Result<Self> {
        let arg = arg.into();
        if let BanField::ObjHeader(name) = &field
            && (name.is_empty() || name.contains('\0'))
        {
            return Err(LurkerError::InvalidBan {
                details: format!("bad header name {name:?}"),
            });
        }
        if arg.contains('\0') {
            return Err(LurkerError::InvalidBan {
                details: "argument contains NUL".to_string(),
            });
        }
        let regex = match op {
            BanOp::Match | BanOp::NoMatch => Some(Regex::new(&arg)?),
            BanOp::Eq | BanOp::Ne => None,
        };
        Ok(Self {
            field,
            op,
            arg,
            regex,
        })
    }

    /// Apply the operator to a field value. A missing value only satisfies `!=` and `!~`.
    #[must_use]
    pub fn matches_value(&self, value: Option<&str>) -> bool {
        match (self.op, value) {
            (BanOp::Eq, Some(v)) => v == self.arg,
            (BanOp::Ne, Some(v)) => v != self.arg,
            (BanOp::Match, Some(v)) => self.regex.as_ref().is_some_and(|re| re.is_match(v)),
            (BanOp::NoMatch, Some(v)) => !self.regex.as_ref().is_some_and(|re| re.is_match(v)),
            (BanOp::Eq | BanOp::Match, None) => false,
            (BanOp::Ne | BanOp::NoMatch, None) => true,
        }
    }
}

impl fmt::Display for BanTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.op.symbol(), self.arg)
    }
}

/// An immutable ban predicate.
#[derive(Debug, Clone)]
pub struct BanSpec {
    created: SystemTime,
    tests: Vec<BanTest>,
    scope: BanFlags,
    blob: Box<[u8]>,
}

impl BanSpec {
    /// Build a predicate from its tests.
    pub fn new(created: SystemTime, tests: Vec<BanTest>) -> Result<Self> {
        let mut scope = BanFlags::empty();
        for test in &tests {
            if test.field.is_request_scoped() {
                scope.insert(BanFlags::REQ);
            } else {
                scope.insert(BanFlags::OBJ);
            }
        }
        let blob = encode(created, &tests, scope);
        if u32::try_from(blob.len()).is_err() {
            return Err(LurkerError::InvalidBan {
                details: format!("predicate too large ({} bytes)", blob.len()),
            });
        }
        Ok(Self {
            created,
            tests,
            scope,
            blob,
        })
    }

    /// Empty predicate for the baseline entry. It never matches anything.
    #[must_use]
    pub fn baseline(created: SystemTime) -> Self {
        let scope = BanFlags::empty();
        let blob = encode(created, &[], scope);
        Self {
            created,
            tests: Vec::new(),
            scope,
            blob,
        }
    }

    /// Insertion time.
    #[must_use]
    pub fn created(&self) -> SystemTime {
        self.created
    }

    /// How long ago this ban was created; zero for bans from the future.
    #[must_use]
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.created).unwrap_or(Duration::ZERO)
    }

    /// Clauses, in insertion order.
    #[must_use]
    pub fn tests(&self) -> &[BanTest] {
        &self.tests
    }

    /// HAS_OBJ_SCOPE / HAS_REQ_SCOPE.
    #[must_use]
    pub fn scope(&self) -> BanFlags {
        self.scope
    }

    /// Encoded form handed to ban info sinks.
    #[must_use]
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Length recorded in the blob header.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut raw = [0_u8; 4];
        raw.copy_from_slice(&self.blob[OFF_LENGTH..OFF_LENGTH + 4]);
        u32::from_le_bytes(raw) as usize
    }

    /// True for a predicate with no tests.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Two predicates are duplicates when their bodies are byte-identical.
    #[must_use]
    pub fn same_predicate(&self, other: &Self) -> bool {
        self.blob.len() == other.blob.len() && self.blob[OFF_FLAGS..] == other.blob[OFF_FLAGS..]
    }
}

impl fmt::Display for BanSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, test) in self.tests.iter().enumerate() {
            if i > 0 {
                f.write_str(" && ")?;
            }
            write!(f, "{test}")?;
        }
        Ok(())
    }
}

fn encode(created: SystemTime, tests: &[BanTest], scope: BanFlags) -> Box<[u8]> {
    let mut out = Vec::with_capacity(BANS_HEAD_LEN + tests.len() * 16);
    out.extend_from_slice(&epoch_secs(created).to_le_bytes());
    out.extend_from_slice(&[0_u8; 4]);
    out.push(scope.bits());
    for test in tests {
        out.push(test.field.tag());
        out.push(test.op.tag());
        if let BanField::ObjHeader(name) = &test.field {
            out.extend_from_slice(name.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(test.arg.as_bytes());
        out.push(0);
    }
    let len = u32::try_from(out.len()).unwrap_or(u32::MAX);
    out[OFF_LENGTH..OFF_LENGTH + 4].copy_from_slice(&len.to_le_bytes());
    out.into_boxed_slice()
}

/// Creation time stored in a blob header, for tools reading raw blobs.
#[must_use]
pub fn blob_created(blob: &[u8]) -> Option<SystemTime> {
    let raw: [u8; 8] = blob.get(..8)?.try_into().ok()?;
    let secs = f64::from_le_bytes(raw);
    (secs.is_finite() && secs >= 0.0).then(|| UNIX_EPOCH + Duration::from_secs_f64(secs))
}
