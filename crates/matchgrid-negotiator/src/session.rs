//! Negotiation sessions — one submitter's side of a cycle.
//!
//! ```text
//! Idle ─► RequestedJob ─► ProposingMachines ─► AwaitingDecision ─┬─► Committed ─► Idle
//!   ▲                         ▲   │                              └─► Rejected ──┐
//!   │                         │   └─(no candidates left)─► Idle                 │
//!   │                         └─────────────────────────────────────────────────┘
//!   └─ Finished (no more jobs, ceiling reached, protocol error, shutdown)
//! ```
//!
//! A session runs in slices: each slice allows a bounded number of
//! job-match attempts, then yields so the next submitter can negotiate.
//! The only shared state a session touches is the machine pool (one claim
//! at a time) and the cycle ledger.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use matchgrid_accounting::{Accountant, LimitCharge, LimitCounters, parse_limits};
use matchgrid_classad::Record;

use crate::config::NegotiatorConfig;
use crate::error::{NegotiationError, NegotiationResult};
use crate::lease::{LeaseEnd, LeaseTerms};
use crate::matcher::{Candidate, lease_terms, rank_candidates, slot_weight};
use crate::pool::{MachineAd, MachinePool};

// ── Collaborator ───────────────────────────────────────────────────

/// A job record together with its id.
#[derive(Debug, Clone)]
pub struct JobAd {
    pub id: String,
    pub record: Arc<Record>,
}

impl JobAd {
    pub fn new(id: impl Into<String>, record: Record) -> Self {
        Self {
            id: id.into(),
            record: Arc::new(record),
        }
    }

    /// Wrap a record, naming it by `JobId` or else `ClusterId.ProcId`.
    pub fn from_record(record: Record) -> Option<Self> {
        let id = match record.lookup_string("JobId") {
            Some(id) => id,
            None => {
                let cluster = record.lookup_integer("ClusterId")?;
                let proc = record.lookup_integer("ProcId").unwrap_or(0);
                format!("{cluster}.{proc}")
            }
        };
        Some(Self::new(id, record))
    }
}

/// The submitter side of negotiation.
///
/// Implementations decide job order and whether an offer is taken. They
/// are called from session tasks, possibly several at once.
pub trait SubmitterQueue: Send + Sync {
    /// Called once before each cycle.
    fn begin_cycle(&self) {}

    /// The next job this submitter wants matched, or `None` when done.
    fn next_job(&self, submitter: &str) -> NegotiationResult<Option<JobAd>>;

    /// Offer a machine for a job. `Ok(true)` takes it.
    fn offer(
        &self,
        submitter: &str,
        job: &JobAd,
        machine: &MachineAd,
        terms: &LeaseTerms,
    ) -> NegotiationResult<bool>;

    /// A lease granted to one of this submitter's jobs is gone; the job
    /// may want a machine again.
    fn lease_ended(&self, _submitter: &str, _job: &str, _reason: LeaseEnd) {}
}

// ── Cycle ledger ───────────────────────────────────────────────────

/// Why a submitter cannot take another match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocked {
    Ceiling,
    Limit(String),
}

impl fmt::Display for Blocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blocked::Ceiling => f.write_str("submitter ceiling reached"),
            Blocked::Limit(name) => write!(f, "concurrency limit {name} reached"),
        }
    }
}

/// Concurrency-limit counts and held-match counts for the cycle in
/// progress: the accountant's view at cycle start plus this cycle's
/// commits.
#[derive(Debug, Default)]
pub struct Ledger {
    inner: Mutex<LedgerInner>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    limits: LimitCounters,
    held: HashMap<String, u32>,
    ceilings: HashMap<String, u32>,
}

impl LedgerInner {
    fn check(&self, submitter: &str, charges: &[LimitCharge]) -> Result<(), Blocked> {
        if let Some(&ceiling) = self.ceilings.get(submitter) {
            if self.held.get(submitter).copied().unwrap_or(0) >= ceiling {
                return Err(Blocked::Ceiling);
            }
        }
        match self.limits.would_exceed(charges) {
            Some(name) => Err(Blocked::Limit(name.to_string())),
            None => Ok(()),
        }
    }
}

impl Ledger {
    pub fn from_accountant(accountant: &Accountant, submitters: &[String]) -> Self {
        let mut inner = LedgerInner {
            limits: accountant.limits().clone(),
            ..LedgerInner::default()
        };
        for name in submitters {
            inner.held.insert(name.clone(), accountant.resources_used(name));
            if let Some(ceiling) = accountant.submitter(name).and_then(|p| p.ceiling) {
                inner.ceilings.insert(name.clone(), ceiling);
            }
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn check(&self, submitter: &str, charges: &[LimitCharge]) -> Result<(), Blocked> {
        self.inner.lock().check(submitter, charges)
    }

    /// Check and, if allowed, take one match's worth of room.
    pub fn reserve(&self, submitter: &str, charges: &[LimitCharge]) -> Result<(), Blocked> {
        let mut inner = self.inner.lock();
        inner.check(submitter, charges)?;
        inner.limits.increment(charges);
        *inner.held.entry(submitter.to_string()).or_insert(0) += 1;
        Ok(())
    }

    pub fn unreserve(&self, submitter: &str, charges: &[LimitCharge]) {
        let mut inner = self.inner.lock();
        inner.limits.decrement(charges);
        if let Some(held) = inner.held.get_mut(submitter) {
            *held = held.saturating_sub(1);
        }
    }
}

// ── Session ────────────────────────────────────────────────────────

/// Everything a session needs from the cycle it runs in.
#[derive(Clone)]
pub struct SessionContext {
    pub pool: Arc<MachinePool>,
    pub ledger: Arc<Ledger>,
    pub queue: Arc<dyn SubmitterQueue>,
    pub config: Arc<NegotiatorConfig>,
    pub shutdown: watch::Receiver<bool>,
}

impl SessionContext {
    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// An accepted offer, waiting to become a lease.
#[derive(Debug, Clone)]
pub struct Commit {
    pub submitter: String,
    pub job: JobAd,
    pub machine: MachineAd,
    pub terms: LeaseTerms,
    pub slot_weight: f64,
    pub limits: Vec<LimitCharge>,
    pub job_rank: f64,
    pub machine_rank: f64,
}

/// How a session ended for this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The submitter has no more jobs to negotiate.
    Exhausted,
    CeilingReached,
    /// The submitter misbehaved; other submitters are unaffected.
    Abandoned(String),
    /// The cycle is shutting down.
    Aborted,
}

#[derive(Debug)]
pub enum SessionState {
    Idle,
    RequestedJob(JobAd),
    ProposingMachines {
        job: JobAd,
        limits: Vec<LimitCharge>,
        candidates: VecDeque<Candidate>,
    },
    AwaitingDecision {
        job: JobAd,
        limits: Vec<LimitCharge>,
        offered: Candidate,
        rest: VecDeque<Candidate>,
    },
    Committed {
        job: JobAd,
        limits: Vec<LimitCharge>,
        offered: Candidate,
        terms: LeaseTerms,
    },
    Rejected {
        job: JobAd,
        limits: Vec<LimitCharge>,
        rest: VecDeque<Candidate>,
    },
    Finished(SessionEnd),
}

/// One submitter's negotiation for one cycle.
#[derive(Debug)]
pub struct Session {
    submitter: String,
    /// Place in the cycle's priority order.
    position: usize,
    state: SessionState,
    /// Jobs already handed out this cycle.
    seen: HashSet<String>,
    commits: Vec<Commit>,
    /// Jobs that found no available machine at all.
    unmatched: Vec<JobAd>,
    attempts: u32,
}

impl Session {
    pub fn new(submitter: impl Into<String>, position: usize) -> Self {
        Self {
            submitter: submitter.into(),
            position,
            state: SessionState::Idle,
            seen: HashSet::new(),
            commits: Vec::new(),
            unmatched: Vec::new(),
            attempts: 0,
        }
    }

    pub fn submitter(&self) -> &str {
        &self.submitter
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, SessionState::Finished(_))
    }

    pub fn end(&self) -> Option<&SessionEnd> {
        match &self.state {
            SessionState::Finished(end) => Some(end),
            _ => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn take_commits(&mut self) -> Vec<Commit> {
        std::mem::take(&mut self.commits)
    }

    pub fn unmatched(&self) -> &[JobAd] {
        &self.unmatched
    }

    /// Negotiate until the slice's attempts are used up or the session
    /// finishes. A job under negotiation is always seen through.
    pub fn run_slice(&mut self, ctx: &SessionContext) {
        let mut budget = ctx.config.fair_share_slice;
        while self.is_active() {
            if matches!(self.state, SessionState::Idle) && budget == 0 {
                return;
            }
            let state = std::mem::replace(&mut self.state, SessionState::Idle);
            self.state = self.step(state, ctx, &mut budget);
        }
    }

    fn step(&mut self, state: SessionState, ctx: &SessionContext, budget: &mut u32) -> SessionState {
        match state {
            SessionState::Idle => {
                if ctx.shutting_down() {
                    return SessionState::Finished(SessionEnd::Aborted);
                }
                match ctx.queue.next_job(&self.submitter) {
                    Ok(Some(job)) if !self.seen.insert(job.id.clone()) => self.abandon(
                        NegotiationError::protocol(
                            &self.submitter,
                            format!("job {} offered twice in one cycle", job.id),
                        ),
                    ),
                    Ok(Some(job)) => SessionState::RequestedJob(job),
                    Ok(None) => {
                        debug!(submitter = %self.submitter, "no more jobs");
                        SessionState::Finished(SessionEnd::Exhausted)
                    }
                    Err(e) => self.abandon(e),
                }
            }

            SessionState::RequestedJob(job) => {
                *budget = budget.saturating_sub(1);
                self.attempts += 1;
                let limits = match job.record.lookup_string("ConcurrencyLimits") {
                    Some(text) => match parse_limits(&text) {
                        Ok(limits) => limits,
                        Err(e) => {
                            warn!(submitter = %self.submitter, job = %job.id, error = %e, "bad concurrency limits, skipping job");
                            return SessionState::Idle;
                        }
                    },
                    None => Vec::new(),
                };
                match ctx.ledger.check(&self.submitter, &limits) {
                    Err(Blocked::Ceiling) => {
                        debug!(submitter = %self.submitter, "ceiling reached");
                        return SessionState::Finished(SessionEnd::CeilingReached);
                    }
                    Err(blocked) => {
                        debug!(submitter = %self.submitter, job = %job.id, %blocked, "job held back");
                        return SessionState::Idle;
                    }
                    Ok(()) => {}
                }
                let snapshot = ctx.pool.snapshot_available();
                let candidates: VecDeque<Candidate> =
                    rank_candidates(&job.record, &snapshot).into();
                if candidates.is_empty() {
                    debug!(submitter = %self.submitter, job = %job.id, "no matching machine available");
                    self.unmatched.push(job);
                    return SessionState::Idle;
                }
                SessionState::ProposingMachines {
                    job,
                    limits,
                    candidates,
                }
            }

            SessionState::ProposingMachines {
                job,
                limits,
                mut candidates,
            } => {
                if ctx.shutting_down() {
                    return SessionState::Finished(SessionEnd::Aborted);
                }
                let Some(offered) = candidates.pop_front() else {
                    debug!(submitter = %self.submitter, job = %job.id, "candidates exhausted");
                    return SessionState::Idle;
                };
                if !ctx.pool.try_claim(offered.index) {
                    // Taken by a concurrent session since the snapshot.
                    return SessionState::ProposingMachines {
                        job,
                        limits,
                        candidates,
                    };
                }
                if let Err(blocked) = ctx.ledger.reserve(&self.submitter, &limits) {
                    ctx.pool.release(offered.index);
                    debug!(submitter = %self.submitter, job = %job.id, %blocked, "job held back");
                    return match blocked {
                        Blocked::Ceiling => SessionState::Finished(SessionEnd::CeilingReached),
                        Blocked::Limit(_) => SessionState::Idle,
                    };
                }
                SessionState::AwaitingDecision {
                    job,
                    limits,
                    offered,
                    rest: candidates,
                }
            }

            SessionState::AwaitingDecision {
                job,
                limits,
                offered,
                rest,
            } => {
                let terms = lease_terms(&job.record, &offered.machine.record, &ctx.config);
                match ctx.queue.offer(&self.submitter, &job, &offered.machine, &terms) {
                    Ok(true) => SessionState::Committed {
                        job,
                        limits,
                        offered,
                        terms,
                    },
                    Ok(false) => {
                        ctx.pool.release(offered.index);
                        ctx.ledger.unreserve(&self.submitter, &limits);
                        debug!(submitter = %self.submitter, job = %job.id, machine = %offered.machine.name, "offer rejected");
                        SessionState::Rejected { job, limits, rest }
                    }
                    Err(e) => {
                        ctx.pool.release(offered.index);
                        ctx.ledger.unreserve(&self.submitter, &limits);
                        self.abandon(e)
                    }
                }
            }

            SessionState::Committed {
                job,
                limits,
                offered,
                terms,
            } => {
                info!(
                    submitter = %self.submitter,
                    job = %job.id,
                    machine = %offered.machine.name,
                    job_rank = offered.job_rank,
                    "match committed"
                );
                self.commits.push(Commit {
                    submitter: self.submitter.clone(),
                    slot_weight: slot_weight(&offered.machine.record),
                    job,
                    machine: offered.machine,
                    terms,
                    limits,
                    job_rank: offered.job_rank,
                    machine_rank: offered.machine_rank,
                });
                SessionState::Idle
            }

            SessionState::Rejected { job, limits, rest } => {
                if rest.is_empty() {
                    SessionState::Idle
                } else {
                    SessionState::ProposingMachines {
                        job,
                        limits,
                        candidates: rest,
                    }
                }
            }

            finished @ SessionState::Finished(_) => finished,
        }
    }

    fn abandon(&self, error: NegotiationError) -> SessionState {
        warn!(submitter = %self.submitter, error = %error, "session abandoned");
        SessionState::Finished(SessionEnd::Abandoned(error.to_string()))
    }
}
