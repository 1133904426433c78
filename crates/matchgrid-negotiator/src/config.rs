//! matchgrid.toml configuration.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Policy expressions are parsed when the file is loaded; a bad expression
//! fails the load rather than the first cycle that needs it.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use matchgrid_accounting::AccountingConfig;
use matchgrid_classad::{Expr, parse_expr};

use crate::error::{NegotiationError, NegotiationResult};

/// Upper bound for every duration setting: ten years.
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiatorConfig {
    /// Delay between cycles when running as a daemon.
    pub cycle_interval_secs: u64,
    /// Job-match attempts a submitter gets per round.
    pub fair_share_slice: u32,
    /// Sessions run side by side within a round. 1 keeps strict order.
    ///
    /// Above 1, the sessions of a batch race for machines: a submitter
    /// later in fair-share order can claim a machine an earlier one would
    /// have ranked first. Throughput is traded for strict ordering.
    pub max_concurrent_sessions: usize,
    pub consider_preemption: bool,
    /// Used for machines without their own `PreemptionRequirements`.
    pub preemption_requirements: Option<String>,
    pub preemption_grace_secs: u64,
    pub default_lease_secs: u64,
    pub max_lease_secs: u64,
    /// Maximum for concurrency limits not listed in `concurrency_limits`.
    pub concurrency_limit_default: Option<f64>,
    pub concurrency_limits: HashMap<String, f64>,
    pub accounting: AccountingConfig,

    #[serde(skip)]
    pub(crate) preemption_policy: Option<Expr>,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 60,
            fair_share_slice: 5,
            max_concurrent_sessions: 1,
            consider_preemption: true,
            preemption_requirements: None,
            preemption_grace_secs: 600,
            default_lease_secs: 1200,
            max_lease_secs: 86_400,
            concurrency_limit_default: None,
            concurrency_limits: HashMap::new(),
            accounting: AccountingConfig::default(),
            preemption_policy: None,
        }
    }
}

impl NegotiatorConfig {
    pub fn from_file(path: &Path) -> NegotiationResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NegotiationError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> NegotiationResult<Self> {
        let config: NegotiatorConfig =
            toml::from_str(content).map_err(|e| NegotiationError::Config(e.to_string()))?;
        config.validated()
    }

    /// Check ranges and parse policy expressions.
    pub fn validated(mut self) -> NegotiationResult<Self> {
        if self.fair_share_slice == 0 {
            return Err(NegotiationError::Config(
                "fair_share_slice must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(NegotiationError::Config(
                "max_concurrent_sessions must be at least 1".to_string(),
            ));
        }
        if self.cycle_interval_secs == 0 {
            return Err(NegotiationError::Config(
                "cycle_interval_secs must be at least 1".to_string(),
            ));
        }
        for (key, secs) in [
            ("cycle_interval_secs", self.cycle_interval_secs),
            ("preemption_grace_secs", self.preemption_grace_secs),
            ("default_lease_secs", self.default_lease_secs),
            ("max_lease_secs", self.max_lease_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(NegotiationError::Config(format!(
                    "{key} must be at most {MAX_DURATION_SECS}"
                )));
            }
        }
        if !(self.accounting.half_life_secs > 0.0 && self.accounting.half_life_secs.is_finite()) {
            return Err(NegotiationError::Config(
                "accounting.half_life_secs must be positive".to_string(),
            ));
        }
        self.preemption_policy = match &self.preemption_requirements {
            Some(text) => Some(parse_expr(text).map_err(|e| {
                NegotiationError::Config(format!("preemption_requirements: {e}"))
            })?),
            None => None,
        };
        Ok(self)
    }

    /// Builder used by tests and embedders.
    pub fn with_preemption_requirements(mut self, text: &str) -> NegotiationResult<Self> {
        self.preemption_requirements = Some(text.to_string());
        self.validated()
    }

    /// The parsed fallback preemption policy, if any.
    pub fn preemption_policy(&self) -> Option<&Expr> {
        self.preemption_policy.as_ref()
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn preemption_grace(&self) -> Duration {
        Duration::from_secs(self.preemption_grace_secs)
    }
}
