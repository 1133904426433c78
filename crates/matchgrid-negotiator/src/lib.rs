//! matchgrid-negotiator — pairs jobs with machines.
//!
//! Machines and jobs describe themselves as [`Record`]s. Each cycle the
//! matchmaker walks submitters in fair-share order and, for each of their
//! jobs, offers the best machine whose requirements and the job's
//! requirements both hold. Accepted offers become leases; leases that
//! lapse or are preempted return their machines to the pool.
//!
//! # Components
//!
//! - **`matcher`** — bidirectional match predicate, ranks, lease terms
//! - **`pool`** — the available-machine pool with per-entry claims
//! - **`lease`** — lease arena and clocks
//! - **`session`** — per-submitter negotiation state machine and the
//!   submitter-queue collaborator
//! - **`matchmaker`** — the cycle: ordering, rounds, preemption, accounting
//! - **`config`** — `matchgrid.toml`
//!
//! [`Record`]: matchgrid_classad::Record

pub mod config;
pub mod error;
pub mod lease;
pub mod matcher;
pub mod matchmaker;
pub mod pool;
pub mod session;

pub use config::NegotiatorConfig;
pub use error::{NegotiationError, NegotiationResult};
pub use lease::{
    Clock, ExpiredLease, Lease, LeaseArena, LeaseEnd, LeaseState, LeaseTerms, ManualClock, MonotonicClock, machine_key,
};
pub use matcher::{Candidate, MatchOutcome, RejectReason, is_match, lease_terms, preemption_allowed, rank_value};
pub use matchmaker::{CycleReport, EndedLease, MatchSummary, Matchmaker, PreemptionSummary, RecordSource};
pub use pool::{MachineAd, MachinePool};
pub use session::{Blocked, Commit, JobAd, Ledger, Session, SessionContext, SessionEnd, SessionState, SubmitterQueue};
