//! Accounting configuration (the `[accounting]` table).

use serde::{Deserialize, Serialize};

/// Submitter names with this prefix get the nice-user factor.
pub const NICE_USER_PREFIX: &str = "nice-user.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// Usage half-life in seconds.
    pub half_life_secs: f64,
    /// Floor applied before the priority factor.
    pub min_priority: f64,
    pub default_priority_factor: f64,
    pub nice_user_priority_factor: f64,
    /// Charge each match its `SlotWeight` instead of 1.0.
    pub use_slot_weights: bool,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            half_life_secs: 86_400.0,
            min_priority: 0.5,
            default_priority_factor: 1.0,
            nice_user_priority_factor: 1e10,
            use_slot_weights: true,
        }
    }
}
