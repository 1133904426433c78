//! Concurrency limits.
//!
//! A job names the limits it consumes in its `ConcurrencyLimits` string:
//! `"license, db:2.5, gpu.a100"`. Names are case-insensitive and the
//! increment defaults to 1. Each limit has a maximum, looked up as the
//! exact name, then the part before the first `.`, then the configured
//! default.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{AccountingError, AccountingResult};
use matchgrid_state::LimitCharge;

/// Parse a `ConcurrencyLimits` string into charges.
pub fn parse_limits(text: &str) -> AccountingResult<Vec<LimitCharge>> {
    let mut charges: Vec<LimitCharge> = Vec::new();
    for part in text.split([',', ' ']).map(str::trim).filter(|p| !p.is_empty()) {
        let (name, increment) = match part.split_once(':') {
            Some((name, inc)) => {
                let inc: f64 = inc
                    .trim()
                    .parse()
                    .map_err(|_| AccountingError::InvalidLimit(part.to_string()))?;
                (name.trim(), inc)
            }
            None => (part, 1.0),
        };
        if name.is_empty() || !increment.is_finite() || increment <= 0.0 {
            return Err(AccountingError::InvalidLimit(part.to_string()));
        }
        let name = name.to_ascii_lowercase();
        match charges.iter_mut().find(|c| c.name == name) {
            Some(existing) => existing.increment += increment,
            None => charges.push(LimitCharge { name, increment }),
        }
    }
    Ok(charges)
}

/// In-use counts and maxima for every limit.
#[derive(Debug, Clone, Default)]
pub struct LimitCounters {
    counts: HashMap<String, f64>,
    maxima: HashMap<String, f64>,
    /// Maximum for limits without an explicit entry; `None` is unlimited.
    default_max: Option<f64>,
}

impl LimitCounters {
    pub fn new(default_max: Option<f64>, maxima: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            counts: HashMap::new(),
            maxima: maxima
                .into_iter()
                .map(|(name, max)| (name.to_ascii_lowercase(), max))
                .collect(),
            default_max,
        }
    }

    /// Replace maxima, keeping the current counts.
    pub fn configure(
        &mut self,
        default_max: Option<f64>,
        maxima: impl IntoIterator<Item = (String, f64)>,
    ) {
        let counts = std::mem::take(&mut self.counts);
        *self = Self::new(default_max, maxima);
        self.counts = counts;
    }

    pub fn max_for(&self, name: &str) -> Option<f64> {
        let name = name.to_ascii_lowercase();
        if let Some(max) = self.maxima.get(&name) {
            return Some(*max);
        }
        if let Some((prefix, _)) = name.split_once('.') {
            if let Some(max) = self.maxima.get(prefix) {
                return Some(*max);
            }
        }
        self.default_max
    }

    pub fn count(&self, name: &str) -> f64 {
        self.counts
            .get(&name.to_ascii_lowercase())
            .copied()
            .unwrap_or(0.0)
    }

    /// The first limit that `charges` would push over its maximum.
    pub fn would_exceed<'a>(&self, charges: &'a [LimitCharge]) -> Option<&'a str> {
        charges.iter().find_map(|c| {
            let max = self.max_for(&c.name)?;
            (self.count(&c.name) + c.increment > max).then_some(c.name.as_str())
        })
    }

    pub fn increment(&mut self, charges: &[LimitCharge]) {
        for c in charges {
            let count = self.counts.entry(c.name.clone()).or_insert(0.0);
            *count += c.increment;
            debug!(limit = %c.name, count = *count, "concurrency limit charged");
        }
    }

    pub fn decrement(&mut self, charges: &[LimitCharge]) {
        for c in charges {
            if let Some(count) = self.counts.get_mut(&c.name) {
                *count = (*count - c.increment).max(0.0);
                if *count == 0.0 {
                    self.counts.remove(&c.name);
                }
            }
        }
    }

    pub fn clear_counts(&mut self) {
        self.counts.clear();
    }
}
