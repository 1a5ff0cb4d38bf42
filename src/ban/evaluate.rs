//! Predicate evaluation against an object and, on the request path, a request.

use std::fmt;

use crate::ban::spec::{BanField, BanSpec};
use crate::store::ObjCore;

/// Request attributes visible to request-scoped tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Request URL path.
    pub url: String,
    /// `Host` header, if sent.
    pub host: Option<String>,
}

/// Result of evaluating one predicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// Every test matched and the predicate was non-empty.
    pub matched: bool,
    /// Number of individual tests run before the verdict.
    pub tests: u32,
}

/// Evaluates ban predicates.
pub trait BanEvaluator: Send + Sync + fmt::Debug {
    /// Test `spec` against `oc`. Request-scoped tests see `req`, if any.
    /// Callers may hold the object's head lock.
    fn evaluate(&self, spec: &BanSpec, oc: &ObjCore, req: Option<&RequestContext>) -> Evaluation;
}

/// Default evaluator: every test must match; stops at the first failing test.
///
/// Without a request, a request-scoped test never matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderEvaluator;

impl BanEvaluator for HeaderEvaluator {
    fn evaluate(&self, spec: &BanSpec, oc: &ObjCore, req: Option<&RequestContext>) -> Evaluation {
        let mut tests = 0;
        for test in spec.tests() {
            tests += 1;
            let hit = match &test.field {
                BanField::ObjHeader(name) => test.matches_value(oc.header(name)),
                BanField::ReqUrl => req.is_some_and(|r| test.matches_value(Some(&r.url))),
                BanField::ReqHost => req.is_some_and(|r| test.matches_value(r.host.as_deref())),
            };
            if !hit {
                return Evaluation {
                    matched: false,
                    tests,
                };
            }
        }
        Evaluation {
            matched: !spec.is_empty(),
            tests,
        }
    }
}
