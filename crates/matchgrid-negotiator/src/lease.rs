//! Leases — time-bounded claims on machines.
//!
//! Every committed match becomes a [`Lease`] in the matchmaker's
//! [`LeaseArena`]. A machine with a lease is not offered to anyone else.
//! Expiry is checked by comparing deadlines against a [`Clock`] reading
//! taken once at the start of each cycle, never by timers.
//!
//! ```text
//! Active ──release (keep claim)──► Draining ──deadline──► expired
//!   │  │
//!   │  └──deadline──► expired          release (releaseWhenDone) ──► returned
//!   └──revoke──► PendingPreemption ──grace──► preempted
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{NegotiationError, NegotiationResult};

pub use matchgrid_accounting::machine_key;

// ── Clocks ─────────────────────────────────────────────────────────

/// Time source for lease expiry and accounting.
pub trait Clock: Send + Sync {
    /// Monotonic time since an arbitrary fixed origin.
    fn now(&self) -> Duration;

    /// Wall-clock Unix seconds, used for usage accounting.
    fn epoch_secs(&self) -> u64 {
        matchgrid_accounting::epoch_secs()
    }
}

/// The real monotonic clock.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
    /// Unix seconds at monotonic time zero.
    epoch_base: u64,
}

impl ManualClock {
    pub fn new(epoch_base: u64) -> Self {
        Self {
            now: Mutex::new(Duration::ZERO),
            epoch_base,
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, to: Duration) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn epoch_secs(&self) -> u64 {
        self.epoch_base + self.now().as_secs()
    }
}

// ── Leases ─────────────────────────────────────────────────────────

/// What a submitter is offered along with a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LeaseTerms {
    pub duration_secs: u64,
    /// Return the machine as soon as the job finishes.
    pub release_when_done: bool,
}

impl LeaseTerms {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Active,
    /// The job finished but the claim is kept until the deadline.
    Draining,
    /// Revoked for preemption; the machine comes back at `returns_at`.
    PendingPreemption { returns_at: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub id: String,
    pub machine: String,
    pub submitter: String,
    pub job: String,
    pub terms: LeaseTerms,
    pub granted_at: Duration,
    pub deadline: Duration,
    pub state: LeaseState,
}

impl Lease {
    /// Whether the lease can still be revoked in favour of another job.
    pub fn is_preemptible(&self) -> bool {
        !matches!(self.state, LeaseState::PendingPreemption { .. })
    }

    /// How long the machine has been held.
    pub fn held_for(&self, now: Duration) -> Duration {
        now.saturating_sub(self.granted_at)
    }
}

/// Why a lease left the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseEnd {
    Expired,
    Preempted,
    Released,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredLease {
    pub lease: Lease,
    pub reason: LeaseEnd,
}

/// All live leases, indexed by id and by machine.
#[derive(Debug, Default)]
pub struct LeaseArena {
    leases: BTreeMap<String, Lease>,
    /// Keyed by [`machine_key`]; leases keep the advertised spelling.
    by_machine: HashMap<String, String>,
    next_id: u64,
}

impl LeaseArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Grant a lease. The machine must not already be claimed.
    pub fn create(
        &mut self,
        machine: &str,
        submitter: &str,
        job: &str,
        terms: LeaseTerms,
        now: Duration,
    ) -> NegotiationResult<&Lease> {
        let key = machine_key(machine);
        if let Some(holder) = self.by_machine.get(&key) {
            return Err(NegotiationError::protocol(
                submitter,
                format!("machine {machine} already held by lease {holder}"),
            ));
        }
        self.next_id += 1;
        // Zero-padded so id order is grant order.
        let id = format!("lease-{:08}", self.next_id);
        let lease = Lease {
            id: id.clone(),
            machine: machine.to_string(),
            submitter: submitter.to_string(),
            job: job.to_string(),
            terms,
            granted_at: now,
            deadline: now.saturating_add(terms.duration()),
            state: LeaseState::Active,
        };
        debug!(lease = %id, machine, submitter, secs = terms.duration_secs, "lease granted");
        self.by_machine.insert(key, id.clone());
        Ok(self.leases.entry(id).or_insert(lease))
    }

    pub fn get(&self, id: &str) -> Option<&Lease> {
        self.leases.get(id)
    }

    /// Extend a lease by its full duration from `now`. Leases pending
    /// preemption are not extended. Returns the deadline in force.
    pub fn renew(&mut self, id: &str, now: Duration) -> NegotiationResult<Duration> {
        let lease = self
            .leases
            .get_mut(id)
            .ok_or_else(|| NegotiationError::UnknownLease(id.to_string()))?;
        match lease.state {
            LeaseState::Active => {
                lease.deadline = now.saturating_add(lease.terms.duration());
                Ok(lease.deadline)
            }
            LeaseState::Draining => Ok(lease.deadline),
            LeaseState::PendingPreemption { returns_at } => Ok(returns_at),
        }
    }

    /// The job on this lease finished. Returns the lease if the machine
    /// goes back to the pool now.
    pub fn release(&mut self, id: &str) -> NegotiationResult<Option<ExpiredLease>> {
        let lease = self
            .leases
            .get_mut(id)
            .ok_or_else(|| NegotiationError::UnknownLease(id.to_string()))?;
        if !lease.terms.release_when_done {
            if lease.state == LeaseState::Active {
                lease.state = LeaseState::Draining;
            }
            return Ok(None);
        }
        Ok(self.remove(id).map(|lease| ExpiredLease {
            lease,
            reason: LeaseEnd::Released,
        }))
    }

    /// Revoke a lease for preemption. The machine stays claimed until
    /// `grace` has passed.
    pub fn revoke(&mut self, id: &str, grace: Duration, now: Duration) -> NegotiationResult<Duration> {
        let lease = self
            .leases
            .get_mut(id)
            .ok_or_else(|| NegotiationError::UnknownLease(id.to_string()))?;
        if let LeaseState::PendingPreemption { returns_at } = lease.state {
            return Ok(returns_at);
        }
        let returns_at = now.saturating_add(grace);
        lease.state = LeaseState::PendingPreemption { returns_at };
        info!(lease = %id, machine = %lease.machine, grace_secs = grace.as_secs(), "lease revoked");
        Ok(returns_at)
    }

    /// Remove every lease whose deadline or grace period has passed.
    pub fn expire(&mut self, now: Duration) -> Vec<ExpiredLease> {
        let due: Vec<(String, LeaseEnd)> = self
            .leases
            .values()
            .filter_map(|l| match l.state {
                LeaseState::PendingPreemption { returns_at } if returns_at <= now => {
                    Some((l.id.clone(), LeaseEnd::Preempted))
                }
                LeaseState::Active | LeaseState::Draining if l.deadline <= now => {
                    Some((l.id.clone(), LeaseEnd::Expired))
                }
                _ => None,
            })
            .collect();
        due.into_iter()
            .filter_map(|(id, reason)| {
                self.remove(&id)
                    .map(|lease| ExpiredLease { lease, reason })
            })
            .collect()
    }

    pub fn holder_of(&self, machine: &str) -> Option<&Lease> {
        self.by_machine
            .get(&machine_key(machine))
            .and_then(|id| self.leases.get(id))
    }

    pub fn is_claimed(&self, machine: &str) -> bool {
        self.by_machine.contains_key(&machine_key(machine))
    }

    /// Leases in grant order.
    pub fn iter(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values()
    }

    fn remove(&mut self, id: &str) -> Option<Lease> {
        let lease = self.leases.remove(id)?;
        self.by_machine.remove(&machine_key(&lease.machine));
        Some(lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TERMS: LeaseTerms = LeaseTerms {
        duration_secs: 100,
        release_when_done: true,
    };

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn create_claims_machine() {
        let mut arena = LeaseArena::new();
        let id = arena.create("slot1", "alice", "1.0", TERMS, secs(0)).unwrap().id.clone();
        assert!(arena.is_claimed("slot1"));
        assert_eq!(arena.holder_of("slot1").unwrap().id, id);
        assert!(arena.create("slot1", "bob", "2.0", TERMS, secs(0)).is_err());
    }

    #[test]
    fn machine_names_ignore_case() {
        let mut arena = LeaseArena::new();
        let id = arena.create("slot1@Node", "alice", "1.0", TERMS, secs(0)).unwrap().id.clone();
        assert!(arena.is_claimed("SLOT1@node"));
        assert_eq!(arena.holder_of("Slot1@NODE").unwrap().machine, "slot1@Node");
        assert!(arena.create("Slot1@node", "bob", "2.0", TERMS, secs(0)).is_err());
        arena.release(&id).unwrap();
        assert!(!arena.is_claimed("slot1@node"));
    }

    #[test]
    fn huge_durations_saturate() {
        let mut arena = LeaseArena::new();
        let terms = LeaseTerms {
            duration_secs: u64::MAX,
            ..TERMS
        };
        let id = arena.create("slot1", "alice", "1.0", terms, secs(10)).unwrap().id.clone();
        assert_eq!(arena.get(&id).unwrap().deadline, Duration::MAX);
        assert_eq!(arena.renew(&id, secs(20)).unwrap(), Duration::MAX);
        assert_eq!(arena.revoke(&id, Duration::MAX, secs(30)).unwrap(), Duration::MAX);
        assert!(arena.expire(secs(u64::MAX)).is_empty());
    }

    #[test]
    fn leases_expire_at_deadline() {
        let mut arena = LeaseArena::new();
        arena.create("slot1", "alice", "1.0", TERMS, secs(0)).unwrap();
        assert!(arena.expire(secs(99)).is_empty());
        let expired = arena.expire(secs(100));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].reason, LeaseEnd::Expired);
        assert!(!arena.is_claimed("slot1"));
    }

    #[test]
    fn renew_pushes_deadline() {
        let mut arena = LeaseArena::new();
        let id = arena.create("slot1", "alice", "1.0", TERMS, secs(0)).unwrap().id.clone();
        assert_eq!(arena.renew(&id, secs(50)).unwrap(), secs(150));
        assert!(arena.expire(secs(120)).is_empty());
        assert!(matches!(arena.renew("lease-x", secs(0)), Err(NegotiationError::UnknownLease(_))));
    }

    #[test]
    fn revoked_lease_returns_after_grace() {
        let mut arena = LeaseArena::new();
        let id = arena.create("slot1", "alice", "1.0", TERMS, secs(0)).unwrap().id.clone();
        arena.revoke(&id, secs(30), secs(10)).unwrap();
        assert!(!arena.get(&id).unwrap().is_preemptible());
        // Renewal does not rescue a revoked lease.
        assert_eq!(arena.renew(&id, secs(20)).unwrap(), secs(40));
        assert!(arena.expire(secs(39)).is_empty());
        assert!(arena.is_claimed("slot1"));
        let expired = arena.expire(secs(40));
        assert_eq!(expired[0].reason, LeaseEnd::Preempted);
        assert!(!arena.is_claimed("slot1"));
    }

    #[test]
    fn release_honours_release_when_done() {
        let mut arena = LeaseArena::new();
        let quick = arena.create("slot1", "alice", "1.0", TERMS, secs(0)).unwrap().id.clone();
        let sticky_terms = LeaseTerms {
            release_when_done: false,
            ..TERMS
        };
        let sticky = arena.create("slot2", "alice", "1.1", sticky_terms, secs(0)).unwrap().id.clone();

        let released = arena.release(&quick).unwrap().unwrap();
        assert_eq!(released.reason, LeaseEnd::Released);
        assert!(!arena.is_claimed("slot1"));

        assert!(arena.release(&sticky).unwrap().is_none());
        assert_eq!(arena.get(&sticky).unwrap().state, LeaseState::Draining);
        assert!(arena.is_claimed("slot2"));
        assert_eq!(arena.expire(secs(100))[0].lease.id, sticky);
    }

    #[test]
    fn iteration_is_in_grant_order() {
        let mut arena = LeaseArena::new();
        for i in 0..12 {
            arena.create(&format!("slot{i}"), "alice", "1.0", TERMS, secs(0)).unwrap();
        }
        let machines: Vec<&str> = arena.iter().map(|l| l.machine.as_str()).collect();
        assert_eq!(machines[0], "slot0");
        assert_eq!(machines[10], "slot10");
    }

    #[test]
    fn manual_clock_moves_both_readings() {
        let clock = ManualClock::new(1_000);
        clock.advance(secs(5));
        assert_eq!(clock.now(), secs(5));
        assert_eq!(clock.epoch_secs(), 1_005);
    }
}
