//! The accountant: per-submitter usage and fair-share priority.
//!
//! Usage is charged in slot-weighted seconds. A match adds its weight to
//! the submitter's `weighted_resources_used`; each priority update charges
//! that weight for the whole interval since the previous update. Partial
//! intervals (matches that started or ended between updates) are
//! corrected through `uncharged_time`.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use matchgrid_state::{AccountingSnapshot, LimitCharge, MatchRecord, StateStore, SubmitterPriority};
use tracing::{debug, info};

use crate::config::{AccountingConfig, NICE_USER_PREFIX};
use crate::error::AccountingResult;
use crate::limits::LimitCounters;

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Machine names compare without regard to ASCII case.
pub fn machine_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Usage and priority for every known submitter.
#[derive(Debug, Clone, Default)]
pub struct Accountant {
    config: AccountingConfig,
    submitters: BTreeMap<String, SubmitterPriority>,
    /// [`machine_key`] → the match charging it.
    matches: HashMap<String, MatchRecord>,
    limits: LimitCounters,
    last_update: Option<u64>,
}

impl Accountant {
    pub fn new(config: AccountingConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &AccountingConfig {
        &self.config
    }

    /// Set concurrency-limit maxima. In-use counts are kept.
    pub fn configure_limits(
        &mut self,
        default_max: Option<f64>,
        maxima: impl IntoIterator<Item = (String, f64)>,
    ) {
        self.limits.configure(default_max, maxima);
    }

    pub fn limits(&self) -> &LimitCounters {
        &self.limits
    }

    pub fn last_update(&self) -> Option<u64> {
        self.last_update
    }

    // ── Lookups ────────────────────────────────────────────────────

    pub fn submitter(&self, name: &str) -> Option<&SubmitterPriority> {
        self.submitters.get(name)
    }

    pub fn submitters(&self) -> impl Iterator<Item = &SubmitterPriority> {
        self.submitters.values()
    }

    fn entry(&mut self, name: &str) -> &mut SubmitterPriority {
        self.submitters
            .entry(name.to_string())
            .or_insert_with(|| SubmitterPriority::new(name))
    }

    /// Decayed usage ("real priority"). Unknown submitters have none.
    pub fn priority(&self, name: &str) -> f64 {
        self.submitters.get(name).map_or(0.0, |p| p.priority)
    }

    pub fn priority_factor(&self, name: &str) -> f64 {
        if let Some(factor) = self.submitters.get(name).and_then(|p| p.priority_factor) {
            return factor;
        }
        if name.starts_with(NICE_USER_PREFIX) {
            self.config.nice_user_priority_factor
        } else {
            self.config.default_priority_factor
        }
    }

    /// `max(priority, min_priority) × priority_factor`. Lower is better.
    pub fn effective_priority(&self, name: &str) -> f64 {
        self.priority(name).max(self.config.min_priority) * self.priority_factor(name)
    }

    pub fn resources_used(&self, name: &str) -> u32 {
        self.submitters.get(name).map_or(0, |p| p.resources_used)
    }

    /// Whether the submitter may take one more match under its ceiling.
    pub fn below_ceiling(&self, name: &str) -> bool {
        match self.submitters.get(name).and_then(|p| p.ceiling) {
            Some(ceiling) => self.resources_used(name) < ceiling,
            None => true,
        }
    }

    pub fn match_for(&self, machine: &str) -> Option<&MatchRecord> {
        self.matches.get(&machine_key(machine))
    }

    pub fn matches(&self) -> impl Iterator<Item = &MatchRecord> {
        self.matches.values()
    }

    /// The first concurrency limit `charges` would push over its maximum.
    pub fn limit_exceeded<'a>(&self, charges: &'a [LimitCharge]) -> Option<&'a str> {
        self.limits.would_exceed(charges)
    }

    // ── Administration ─────────────────────────────────────────────

    pub fn set_priority(&mut self, name: &str, priority: f64) {
        self.entry(name).priority = priority.max(0.0);
    }

    pub fn set_priority_factor(&mut self, name: &str, factor: f64) {
        self.entry(name).priority_factor = Some(factor);
    }

    pub fn set_ceiling(&mut self, name: &str, ceiling: Option<u32>) {
        self.entry(name).ceiling = ceiling;
    }

    /// Forget a submitter's accumulated usage. Current matches stay charged.
    pub fn reset_usage(&mut self, name: &str) {
        if let Some(p) = self.submitters.get_mut(name) {
            p.priority = 0.0;
            p.accumulated_usage = 0.0;
            p.uncharged_time = 0.0;
            p.begin_usage_time = 0;
        }
    }

    // ── Ordering ───────────────────────────────────────────────────

    /// Sort submitters by ascending effective priority, ties by name.
    pub fn ordered<S: AsRef<str>>(&self, submitters: &[S]) -> Vec<String> {
        let mut names: Vec<String> = submitters.iter().map(|s| s.as_ref().to_string()).collect();
        names.sort_by(|a, b| {
            self.effective_priority(a)
                .total_cmp(&self.effective_priority(b))
                .then_with(|| a.cmp(b))
        });
        names.dedup();
        names
    }

    // ── Decay ──────────────────────────────────────────────────────

    /// Age every submitter's priority toward its recent usage.
    ///
    /// The first call only records the time. A clock that has not moved
    /// forward leaves everything untouched.
    pub fn update_priorities(&mut self, now: u64) {
        let Some(last) = self.last_update else {
            self.last_update = Some(now);
            return;
        };
        if now <= last {
            return;
        }
        let elapsed = (now - last) as f64;
        let aging = 0.5_f64.powf(elapsed / self.config.half_life_secs);
        for p in self.submitters.values_mut() {
            let recent = p.weighted_resources_used + p.uncharged_time / elapsed;
            p.priority = (p.priority * aging + recent * (1.0 - aging)).max(0.0);
            p.accumulated_usage += p.weighted_resources_used * elapsed + p.uncharged_time;
            p.uncharged_time = 0.0;
            if p.weighted_resources_used > 0.0 {
                p.last_usage_time = now;
            }
            p.last_update = now;
        }
        self.last_update = Some(now);
        debug!(elapsed, aging, submitters = self.submitters.len(), "priorities updated");
    }

    // ── Match charging ─────────────────────────────────────────────

    /// Start charging `submitter` for `machine`.
    pub fn add_match(
        &mut self,
        submitter: &str,
        machine: &str,
        slot_weight: f64,
        limits: &[LimitCharge],
        now: u64,
    ) {
        let key = machine_key(machine);
        if self.matches.contains_key(&key) {
            self.remove_match(machine, now);
        }
        let weight = if self.config.use_slot_weights {
            slot_weight
        } else {
            1.0
        };
        let since_update = self.last_update.map_or(0.0, |last| now.saturating_sub(last) as f64);
        let p = self.entry(submitter);
        p.resources_used += 1;
        p.weighted_resources_used += weight;
        // The next update charges the whole interval; take back the part
        // before this match existed.
        p.uncharged_time -= since_update * weight;
        if p.begin_usage_time == 0 {
            p.begin_usage_time = now;
        }
        p.last_usage_time = now;
        self.limits.increment(limits);
        self.matches.insert(
            key,
            MatchRecord {
                machine: machine.to_string(),
                submitter: submitter.to_string(),
                weight,
                limits: limits.to_vec(),
                start_time: now,
            },
        );
        info!(submitter, machine, weight, "match charged");
    }

    /// Stop charging for `machine`. Returns the match that was removed.
    pub fn remove_match(&mut self, machine: &str, now: u64) -> Option<MatchRecord> {
        let record = self.matches.remove(&machine_key(machine))?;
        // Matches made since the last update already hold a negative
        // correction for the time before they started.
        let start = self.last_update.unwrap_or(record.start_time);
        let charged = now.saturating_sub(start) as f64 * record.weight;
        let p = self.entry(&record.submitter);
        p.resources_used = p.resources_used.saturating_sub(1);
        p.weighted_resources_used = (p.weighted_resources_used - record.weight).max(0.0);
        p.uncharged_time += charged;
        p.last_usage_time = now;
        self.limits.decrement(&record.limits);
        info!(submitter = %record.submitter, machine, "match released");
        Some(record)
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Replace in-memory state with what `store` holds.
    pub fn load(&mut self, store: &StateStore) -> AccountingResult<()> {
        let snapshot = store.load_snapshot()?;
        self.submitters = snapshot
            .submitters
            .into_iter()
            .map(|p| (p.submitter.clone(), p))
            .collect();
        self.limits.clear_counts();
        self.matches.clear();
        for m in snapshot.matches {
            self.limits.increment(&m.limits);
            self.matches.insert(machine_key(&m.machine), m);
        }
        self.last_update = snapshot.last_update;
        info!(
            submitters = self.submitters.len(),
            matches = self.matches.len(),
            "accounting state loaded"
        );
        Ok(())
    }

    pub fn save(&self, store: &StateStore) -> AccountingResult<()> {
        let mut matches: Vec<MatchRecord> = self.matches.values().cloned().collect();
        matches.sort_by(|a, b| a.machine.cmp(&b.machine));
        store.save_snapshot(&AccountingSnapshot {
            submitters: self.submitters.values().cloned().collect(),
            matches,
            last_update: self.last_update,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::parse_limits;

    const DAY: u64 = 86_400;

    fn accountant() -> Accountant {
        Accountant::new(AccountingConfig::default())
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn unknown_submitters_sit_at_the_floor() {
        let acct = accountant();
        assert_eq!(acct.priority("alice"), 0.0);
        assert_eq!(acct.effective_priority("alice"), 0.5);
        assert_eq!(acct.effective_priority("nice-user.bob"), 0.5 * 1e10);
    }

    #[test]
    fn explicit_factor_multiplies() {
        let mut acct = accountant();
        acct.set_priority("alice", 10.0);
        acct.set_priority_factor("alice", 100.0);
        assert_eq!(acct.effective_priority("alice"), 1000.0);
    }

    #[test]
    fn first_update_only_records_time() {
        let mut acct = accountant();
        acct.add_match("alice", "slot1", 1.0, &[], 1000);
        acct.update_priorities(1000);
        assert_eq!(acct.priority("alice"), 0.0);
        assert_eq!(acct.last_update(), Some(1000));
    }

    #[test]
    fn usage_converges_by_half_life() {
        let mut acct = accountant();
        acct.update_priorities(0);
        acct.add_match("alice", "slot1", 4.0, &[], 0);
        acct.update_priorities(DAY);
        // One half-life at a constant 4 slots: halfway from 0 to 4.
        assert!(close(acct.priority("alice"), 2.0));
        assert!(close(acct.submitter("alice").unwrap().accumulated_usage, 4.0 * DAY as f64));

        acct.remove_match("slot1", DAY);
        acct.update_priorities(2 * DAY);
        assert!(close(acct.priority("alice"), 1.0));
    }

    #[test]
    fn partial_intervals_are_charged_exactly() {
        let mut acct = accountant();
        acct.update_priorities(0);
        // Held from t=100 to t=400 within one update interval.
        acct.add_match("alice", "slot1", 2.0, &[], 100);
        acct.remove_match("slot1", 400);
        acct.update_priorities(1000);
        let p = acct.submitter("alice").unwrap();
        assert!(close(p.accumulated_usage, 600.0));
        assert_eq!(p.resources_used, 0);
        assert_eq!(p.uncharged_time, 0.0);
    }

    #[test]
    fn backwards_clock_is_ignored() {
        let mut acct = accountant();
        acct.update_priorities(1000);
        acct.set_priority("alice", 5.0);
        acct.update_priorities(900);
        assert_eq!(acct.priority("alice"), 5.0);
        assert_eq!(acct.last_update(), Some(1000));
    }

    #[test]
    fn ordering_is_ascending_with_name_ties() {
        let mut acct = accountant();
        acct.set_priority("heavy", 100.0);
        acct.set_priority("light", 0.0);
        let order = acct.ordered(&["heavy", "zed", "light", "abe"]);
        assert_eq!(order, vec!["abe", "light", "zed", "heavy"]);
    }

    #[test]
    fn ceilings_cap_held_matches() {
        let mut acct = accountant();
        acct.set_ceiling("alice", Some(1));
        assert!(acct.below_ceiling("alice"));
        acct.add_match("alice", "slot1", 1.0, &[], 0);
        assert!(!acct.below_ceiling("alice"));
        assert!(acct.below_ceiling("bob"));
    }

    #[test]
    fn matches_charge_concurrency_limits() {
        let mut acct = accountant();
        acct.configure_limits(None, [("license".to_string(), 1.0)]);
        let charges = parse_limits("license").unwrap();
        assert_eq!(acct.limit_exceeded(&charges), None);
        acct.add_match("alice", "slot1", 1.0, &charges, 0);
        assert_eq!(acct.limit_exceeded(&charges), Some("license"));
        acct.remove_match("slot1", 10);
        assert_eq!(acct.limit_exceeded(&charges), None);
    }

    #[test]
    fn slot_weights_can_be_disabled() {
        let mut acct = Accountant::new(AccountingConfig {
            use_slot_weights: false,
            ..AccountingConfig::default()
        });
        acct.add_match("alice", "slot1", 8.0, &[], 0);
        assert_eq!(acct.submitter("alice").unwrap().weighted_resources_used, 1.0);
    }

    #[test]
    fn rematching_a_machine_moves_the_charge() {
        let mut acct = accountant();
        acct.add_match("alice", "slot1", 1.0, &[], 0);
        acct.add_match("bob", "slot1", 1.0, &[], 10);
        assert_eq!(acct.resources_used("alice"), 0);
        assert_eq!(acct.resources_used("bob"), 1);
        assert_eq!(acct.match_for("slot1").unwrap().submitter, "bob");
    }

    #[test]
    fn machine_names_ignore_case() {
        let mut acct = accountant();
        acct.add_match("alice", "Slot1@Node", 1.0, &[], 0);
        acct.add_match("alice", "slot1@node", 1.0, &[], 0);
        assert_eq!(acct.resources_used("alice"), 1);
        assert_eq!(acct.match_for("SLOT1@NODE").unwrap().machine, "slot1@node");
        assert!(acct.remove_match("SLOT1@node", 0).is_some());
        assert_eq!(acct.resources_used("alice"), 0);
        assert_eq!(acct.matches().count(), 0);
    }

    #[test]
    fn state_round_trips_through_the_store() {
        let store = StateStore::open_in_memory().unwrap();
        let mut acct = accountant();
        acct.configure_limits(None, [("db".to_string(), 5.0)]);
        acct.update_priorities(0);
        acct.add_match("alice", "slot1", 2.0, &parse_limits("db:2").unwrap(), 0);
        acct.set_priority_factor("bob", 3.0);
        acct.update_priorities(3600);
        acct.save(&store).unwrap();

        let mut restored = accountant();
        restored.configure_limits(None, [("db".to_string(), 5.0)]);
        restored.load(&store).unwrap();
        assert_eq!(restored.last_update(), Some(3600));
        assert_eq!(restored.priority("alice"), acct.priority("alice"));
        assert_eq!(restored.priority_factor("bob"), 3.0);
        assert_eq!(restored.limits().count("db"), 2.0);
        assert_eq!(restored.match_for("slot1").unwrap().weight, 2.0);
    }
}
