//! Domain types for the MatchGrid state store.
//!
//! These types represent persisted accounting state: per-submitter usage
//! and priority, and the matches currently being charged to submitters.
//! All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for a submitter (`user@domain` by convention).
pub type SubmitterId = String;

/// Unique identifier for a machine record (its `Name` attribute).
pub type MachineId = String;

// ── Submitters ─────────────────────────────────────────────────────

/// Usage and priority bookkeeping for one submitter.
///
/// Timestamps are Unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitterPriority {
    pub submitter: SubmitterId,
    /// Decayed historical usage. Lower negotiates first.
    #[serde(default)]
    pub priority: f64,
    /// Explicit multiplier; `None` uses the configured default.
    #[serde(default)]
    pub priority_factor: Option<f64>,
    /// Number of matches currently held.
    #[serde(default)]
    pub resources_used: u32,
    /// Sum of slot weights of matches currently held.
    #[serde(default)]
    pub weighted_resources_used: f64,
    /// Total weighted seconds ever charged.
    #[serde(default)]
    pub accumulated_usage: f64,
    /// Weighted seconds from matches that ended since the last update.
    #[serde(default)]
    pub uncharged_time: f64,
    /// Maximum matches this submitter may hold; `None` is unlimited.
    #[serde(default)]
    pub ceiling: Option<u32>,
    #[serde(default)]
    pub begin_usage_time: u64,
    #[serde(default)]
    pub last_usage_time: u64,
    #[serde(default)]
    pub last_update: u64,
}

impl SubmitterPriority {
    pub fn new(submitter: impl Into<SubmitterId>) -> Self {
        Self {
            submitter: submitter.into(),
            priority: 0.0,
            priority_factor: None,
            resources_used: 0,
            weighted_resources_used: 0.0,
            accumulated_usage: 0.0,
            uncharged_time: 0.0,
            ceiling: None,
            begin_usage_time: 0,
            last_usage_time: 0,
            last_update: 0,
        }
    }

    pub fn table_key(&self) -> &str {
        &self.submitter
    }
}

// ── Matches ────────────────────────────────────────────────────────

/// One concurrency-limit charge held by a match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitCharge {
    /// Lowercased limit name.
    pub name: String,
    pub increment: f64,
}

/// A match currently charged to a submitter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchRecord {
    pub machine: MachineId,
    pub submitter: SubmitterId,
    /// Slot weight charged per second.
    pub weight: f64,
    #[serde(default)]
    pub limits: Vec<LimitCharge>,
    /// When the match was made.
    pub start_time: u64,
}

impl MatchRecord {
    pub fn table_key(&self) -> &str {
        &self.machine
    }
}

/// Everything the accountant persists, written atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountingSnapshot {
    pub submitters: Vec<SubmitterPriority>,
    pub matches: Vec<MatchRecord>,
    pub last_update: Option<u64>,
}
