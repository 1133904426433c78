//! The match predicate and candidate ranking.
//!
//! A job and a machine match only if each side's `Requirements` evaluates
//! to exactly `true` against the other. Undefined and Error reject: a
//! requirement that cannot be decided is never satisfied.
//!
//! Accepted pairs are ordered by:
//! 1. job-side `Rank` (higher first)
//! 2. machine-side `Rank` (higher first)
//! 3. cost of taking the machine (lower first; non-zero only for preemption)
//! 4. snapshot order

use std::cmp::Ordering;
use std::fmt;

use tracing::debug;

use matchgrid_classad::{Expr, Record, Value, evaluate};

use crate::config::NegotiatorConfig;
use crate::lease::LeaseTerms;
use crate::pool::MachineAd;

pub const ATTR_REQUIREMENTS: &str = "Requirements";
pub const ATTR_RANK: &str = "Rank";
pub const ATTR_PREEMPTION_REQUIREMENTS: &str = "PreemptionRequirements";

/// Why a pair was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// The job's requirements were not exactly true; carries what they were.
    JobRequirements(Value),
    MachineRequirements(Value),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::JobRequirements(v) => write!(f, "job requirements evaluated to {v}"),
            RejectReason::MachineRequirements(v) => {
                write!(f, "machine requirements evaluated to {v}")
            }
        }
    }
}

/// Result of the match predicate for one pair.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub accepted: bool,
    pub job_rank: f64,
    pub machine_rank: f64,
    pub reject: Option<RejectReason>,
}

impl MatchOutcome {
    fn rejected(reason: RejectReason) -> Self {
        Self {
            accepted: false,
            job_rank: f64::NEG_INFINITY,
            machine_rank: f64::NEG_INFINITY,
            reject: Some(reason),
        }
    }
}

/// Evaluate both sides' requirements and, if both hold, both ranks.
pub fn is_match(job: &Record, machine: &Record) -> MatchOutcome {
    let job_req = job.evaluate_attr(ATTR_REQUIREMENTS, Some(machine));
    if !job_req.is_true() {
        return MatchOutcome::rejected(RejectReason::JobRequirements(job_req));
    }
    let machine_req = machine.evaluate_attr(ATTR_REQUIREMENTS, Some(job));
    if !machine_req.is_true() {
        return MatchOutcome::rejected(RejectReason::MachineRequirements(machine_req));
    }
    MatchOutcome {
        accepted: true,
        job_rank: rank_value(&job.evaluate_attr(ATTR_RANK, Some(machine))),
        machine_rank: rank_value(&machine.evaluate_attr(ATTR_RANK, Some(job))),
        reject: None,
    }
}

/// Numeric preference of a rank value. Anything non-numeric ranks lowest.
pub fn rank_value(value: &Value) -> f64 {
    match value {
        Value::Integer(i) => *i as f64,
        Value::Real(r) if !r.is_nan() => *r,
        Value::Boolean(b) => f64::from(u8::from(*b)),
        _ => f64::NEG_INFINITY,
    }
}

/// Lease duration and release policy for a pair.
pub fn lease_terms(job: &Record, machine: &Record, config: &NegotiatorConfig) -> LeaseTerms {
    let positive_secs = |v: Value| {
        v.as_f64()
            .filter(|s| s.is_finite() && *s >= 1.0)
            .map(|s| s as u64)
    };
    let requested = positive_secs(job.evaluate_attr("LeaseDuration", Some(machine)))
        .unwrap_or(config.default_lease_secs);
    let machine_cap = positive_secs(machine.evaluate_attr("MaxLeaseDuration", Some(job)))
        .unwrap_or(config.max_lease_secs);
    LeaseTerms {
        duration_secs: requested.min(machine_cap).min(config.max_lease_secs),
        release_when_done: job
            .evaluate_attr("ReleaseWhenDone", Some(machine))
            .as_bool()
            .unwrap_or(true),
    }
}

/// Usage charged per second for holding a machine.
pub fn slot_weight(machine: &Record) -> f64 {
    machine
        .lookup_real("SlotWeight")
        .filter(|w| w.is_finite() && *w >= 0.0)
        .unwrap_or(1.0)
}

/// Whether `machine` may be taken from its current holder for `job`.
///
/// The machine's own `PreemptionRequirements` wins; without one the
/// configured policy applies; without either the answer is no.
pub fn preemption_allowed(machine: &Record, job: &Record, policy: Option<&Expr>) -> bool {
    let verdict = if machine.contains(ATTR_PREEMPTION_REQUIREMENTS) {
        machine.evaluate_attr(ATTR_PREEMPTION_REQUIREMENTS, Some(job))
    } else if let Some(policy) = policy {
        evaluate(policy, machine, Some(job))
    } else {
        return false;
    };
    verdict.is_true()
}

// ── Candidates ─────────────────────────────────────────────────────

/// A machine that accepted a job, with its sort keys.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Position in the snapshot the candidate came from.
    pub index: usize,
    pub machine: MachineAd,
    pub job_rank: f64,
    pub machine_rank: f64,
    pub cost: f64,
}

/// Best-first comparison.
pub fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.job_rank
        .total_cmp(&a.job_rank)
        .then_with(|| b.machine_rank.total_cmp(&a.machine_rank))
        .then_with(|| a.cost.total_cmp(&b.cost))
        .then_with(|| a.index.cmp(&b.index))
}

/// Evaluate `job` against each machine and return the acceptable ones,
/// best first.
pub fn rank_candidates(job: &Record, machines: &[(usize, MachineAd)]) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = machines
        .iter()
        .filter_map(|(index, machine)| {
            let outcome = is_match(job, &machine.record);
            if let Some(reason) = &outcome.reject {
                debug!(machine = %machine.name, %reason, "candidate rejected");
                return None;
            }
            Some(Candidate {
                index: *index,
                machine: machine.clone(),
                job_rank: outcome.job_rank,
                machine_rank: outcome.machine_rank,
                cost: 0.0,
            })
        })
        .collect();
    candidates.sort_by(compare_candidates);
    candidates
}
