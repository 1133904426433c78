//! matchgrid-accounting — fair-share priority and usage accounting.
//!
//! Tracks how much each submitter has been using the pool and turns that
//! into a negotiation order: the submitter with the lowest effective
//! priority value negotiates first.
//!
//! # Components
//!
//! - **`accountant`** — per-submitter usage, exponential decay, effective
//!   priority, ceilings and match charging
//! - **`limits`** — concurrency-limit parsing and counters
//! - **`config`** — half-life, priority floor and factor defaults
//!
//! # Priority model
//!
//! ```text
//! aging     = 0.5 ^ (elapsed / half_life)
//! priority  = priority × aging + recent_usage × (1 − aging)
//! effective = max(priority, min_priority) × priority_factor
//! ```
//!
//! Matches are charged by slot weight per second while held. The
//! accountant is read during a cycle and only written once the cycle is
//! over, so ordering never shifts mid-cycle.

pub mod accountant;
pub mod config;
pub mod error;
pub mod limits;

pub use accountant::{Accountant, epoch_secs, machine_key};
pub use config::AccountingConfig;
pub use error::{AccountingError, AccountingResult};
pub use limits::{LimitCounters, parse_limits};
pub use matchgrid_state::{LimitCharge, MatchRecord, SubmitterPriority};
