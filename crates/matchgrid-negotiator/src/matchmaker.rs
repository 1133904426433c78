//! The matchmaker — the negotiation control loop.
//!
//! One cycle:
//! 1. Expire leases whose deadline or preemption grace has passed, then
//!    age priorities and stop charging for the machines that came back.
//! 2. Snapshot advertised machines; those under lease are not available.
//! 3. Order submitters by ascending effective priority.
//! 4. Run sessions round by round, each submitter getting a fair-share
//!    slice per round, until every session is finished.
//! 5. Consider preemption for jobs that found no available machine.
//! 6. Charge the cycle's new matches and persist accounting.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use matchgrid_accounting::Accountant;
use matchgrid_classad::Record;
use matchgrid_state::StateStore;

use crate::config::NegotiatorConfig;
use crate::error::NegotiationResult;
use crate::lease::{Clock, ExpiredLease, LeaseArena, LeaseEnd, machine_key};
use crate::matcher::{Candidate, compare_candidates, is_match, preemption_allowed};
use crate::pool::{MachineAd, MachinePool};
use crate::session::{JobAd, Ledger, Session, SessionContext, SessionEnd, SubmitterQueue};

/// Supplies the advertised records for each cycle.
pub trait RecordSource: Send + Sync {
    fn machines(&self) -> NegotiationResult<Vec<Record>>;
    fn submitters(&self) -> NegotiationResult<Vec<Record>>;
}

// ── Reports ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct MatchSummary {
    pub submitter: String,
    pub job: String,
    pub machine: String,
    pub lease: String,
    pub lease_secs: u64,
    pub release_when_done: bool,
    pub job_rank: f64,
    pub machine_rank: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreemptionSummary {
    pub machine: String,
    pub lease: String,
    pub victim: String,
    pub victim_job: String,
    pub preemptor: String,
    pub job: String,
    pub grace_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndedLease {
    pub lease: String,
    pub machine: String,
    pub submitter: String,
    pub job: String,
    pub reason: LeaseEnd,
}

impl From<&ExpiredLease> for EndedLease {
    fn from(e: &ExpiredLease) -> Self {
        Self {
            lease: e.lease.id.clone(),
            machine: e.lease.machine.clone(),
            submitter: e.lease.submitter.clone(),
            job: e.lease.job.clone(),
            reason: e.reason,
        }
    }
}

/// What happened in one cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    /// Submitters in the order they negotiated.
    pub submitters: Vec<String>,
    pub machines_available: usize,
    pub matches: Vec<MatchSummary>,
    pub preemptions: Vec<PreemptionSummary>,
    pub ended_leases: Vec<EndedLease>,
    pub abandoned: Vec<String>,
    pub unmatched_jobs: usize,
    pub aborted: bool,
}

// ── Matchmaker ─────────────────────────────────────────────────────

pub struct Matchmaker {
    config: Arc<NegotiatorConfig>,
    accountant: Accountant,
    leases: LeaseArena,
    source: Arc<dyn RecordSource>,
    queue: Arc<dyn SubmitterQueue>,
    clock: Arc<dyn Clock>,
    store: Option<StateStore>,
    cycles: u64,
}

impl Matchmaker {
    pub fn new(
        config: NegotiatorConfig,
        source: Arc<dyn RecordSource>,
        queue: Arc<dyn SubmitterQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut accountant = Accountant::new(config.accounting.clone());
        accountant.configure_limits(
            config.concurrency_limit_default,
            config.concurrency_limits.clone(),
        );
        Self {
            config: Arc::new(config),
            accountant,
            leases: LeaseArena::new(),
            source,
            queue,
            clock,
            store: None,
            cycles: 0,
        }
    }

    /// Load accounting from `store` and save to it after every cycle.
    pub fn with_store(mut self, store: StateStore) -> NegotiationResult<Self> {
        self.accountant.load(&store)?;
        self.store = Some(store);
        Ok(self)
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    pub fn accountant(&self) -> &Accountant {
        &self.accountant
    }

    pub fn accountant_mut(&mut self) -> &mut Accountant {
        &mut self.accountant
    }

    pub fn leases(&self) -> &LeaseArena {
        &self.leases
    }

    /// Extend a lease from now.
    pub fn renew_lease(&mut self, id: &str) -> NegotiationResult<Duration> {
        self.leases.renew(id, self.clock.now())
    }

    /// The job on a lease finished.
    pub fn release_lease(&mut self, id: &str) -> NegotiationResult<()> {
        if let Some(ended) = self.leases.release(id)? {
            self.accountant
                .remove_match(&ended.lease.machine, self.clock.epoch_secs());
            self.queue
                .lease_ended(&ended.lease.submitter, &ended.lease.job, ended.reason);
            info!(lease = %id, machine = %ended.lease.machine, "lease released");
        }
        Ok(())
    }

    /// Run cycles every `cycle_interval_secs` until `shutdown` flips.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.cycle_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_cycle(&shutdown).await {
                        Ok(report) => debug!(cycle = report.cycle, matches = report.matches.len(), "cycle report"),
                        Err(e) => error!(error = %e, "negotiation cycle failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("matchmaker shutting down");
                    break;
                }
            }
            if *shutdown.borrow() {
                info!("matchmaker shutting down");
                break;
            }
        }
    }

    /// Run one negotiation cycle.
    pub async fn run_cycle(&mut self, shutdown: &watch::Receiver<bool>) -> NegotiationResult<CycleReport> {
        self.cycles += 1;
        let now = self.clock.now();
        let mut report = CycleReport {
            cycle: self.cycles,
            ..CycleReport::default()
        };
        info!(cycle = self.cycles, leases = self.leases.len(), "negotiation cycle starting");

        // Step 1: leases and accounting from the previous interval.
        self.accountant.update_priorities(self.clock.epoch_secs());
        for ended in self.leases.expire(now) {
            info!(lease = %ended.lease.id, machine = %ended.lease.machine, reason = ?ended.reason, "lease ended");
            self.queue
                .lease_ended(&ended.lease.submitter, &ended.lease.job, ended.reason);
            report.ended_leases.push(EndedLease::from(&ended));
        }
        self.drop_unleased_matches();

        // Step 2: advertised records.
        let advertised = self.load_machines()?;
        let pool = Arc::new(MachinePool::new(
            advertised
                .iter()
                .filter(|m| !self.leases.is_claimed(&m.name))
                .cloned(),
        ));
        report.machines_available = pool.len();
        let submitters = self.load_submitters()?;

        let preemptible = self.config.consider_preemption && self.leases.iter().any(|l| l.is_preemptible());
        if pool.is_empty() && !preemptible {
            info!(cycle = self.cycles, "no machines available");
            self.finish_cycle(&report);
            return Ok(report);
        }

        // Step 3: fair-share order.
        let order = self.accountant.ordered(&submitters);
        report.submitters = order.clone();
        self.queue.begin_cycle();
        let ctx = SessionContext {
            pool: Arc::clone(&pool),
            ledger: Arc::new(Ledger::from_accountant(&self.accountant, &order)),
            queue: Arc::clone(&self.queue),
            config: Arc::clone(&self.config),
            shutdown: shutdown.clone(),
        };

        // Step 4: rounds.
        let mut sessions: Vec<Session> = order
            .iter()
            .enumerate()
            .map(|(position, name)| Session::new(name.clone(), position))
            .collect();
        let mut pending_charges = Vec::new();
        while sessions.iter().any(Session::is_active) {
            if *shutdown.borrow() {
                report.aborted = true;
                break;
            }
            if pool.available_count() == 0 && !preemptible {
                debug!("pool exhausted");
                break;
            }
            sessions = self.run_round(sessions, &ctx).await;
            for session in &mut sessions {
                for commit in session.take_commits() {
                    let lease = match self.leases.create(
                        &commit.machine.name,
                        &commit.submitter,
                        &commit.job.id,
                        commit.terms,
                        now,
                    ) {
                        Ok(lease) => lease,
                        Err(e) => {
                            error!(error = %e, "committed match could not be leased");
                            continue;
                        }
                    };
                    report.matches.push(MatchSummary {
                        submitter: commit.submitter.clone(),
                        job: commit.job.id.clone(),
                        machine: commit.machine.name.clone(),
                        lease: lease.id.clone(),
                        lease_secs: commit.terms.duration_secs,
                        release_when_done: commit.terms.release_when_done,
                        job_rank: commit.job_rank,
                        machine_rank: commit.machine_rank,
                    });
                    pending_charges.push(commit);
                }
            }
        }
        report.aborted |= sessions
            .iter()
            .any(|s| s.end() == Some(&SessionEnd::Aborted));
        for session in &sessions {
            if let Some(SessionEnd::Abandoned(_)) = session.end() {
                report.abandoned.push(session.submitter().to_string());
            }
            report.unmatched_jobs += session.unmatched().len();
        }

        // Step 5: preemption.
        if self.config.consider_preemption && !report.aborted {
            let machines: HashMap<String, &MachineAd> =
                advertised.iter().map(|m| (machine_key(&m.name), m)).collect();
            for session in &sessions {
                for job in session.unmatched() {
                    if let Some(p) = self.try_preempt(session.submitter(), job, &machines, now) {
                        report.preemptions.push(p);
                    }
                }
            }
        }

        // Step 6: charge the new matches.
        let charged_at = self.clock.epoch_secs();
        for commit in pending_charges {
            self.accountant.add_match(
                &commit.submitter,
                &commit.machine.name,
                commit.slot_weight,
                &commit.limits,
                charged_at,
            );
        }
        self.finish_cycle(&report);
        Ok(report)
    }

    /// Give every active session one slice, in priority order or in
    /// batches of `max_concurrent_sessions`.
    async fn run_round(&self, sessions: Vec<Session>, ctx: &SessionContext) -> Vec<Session> {
        let width = self.config.max_concurrent_sessions;
        if width <= 1 {
            return sessions
                .into_iter()
                .map(|mut s| {
                    if s.is_active() {
                        s.run_slice(ctx);
                    }
                    s
                })
                .collect();
        }

        let mut done = Vec::with_capacity(sessions.len());
        let mut remaining = sessions.into_iter().peekable();
        while remaining.peek().is_some() {
            let mut tasks = JoinSet::new();
            for mut session in remaining.by_ref().take(width) {
                if !session.is_active() {
                    done.push(session);
                    continue;
                }
                let ctx = ctx.clone();
                tasks.spawn_blocking(move || {
                    session.run_slice(&ctx);
                    session
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(session) => done.push(session),
                    Err(e) => error!(error = %e, "session task failed"),
                }
            }
        }
        done.sort_by_key(Session::position);
        done
    }

    /// Revoke one lease held by a lower-priority submitter for `job`, if
    /// any machine allows it.
    fn try_preempt(
        &mut self,
        submitter: &str,
        job: &JobAd,
        machines: &HashMap<String, &MachineAd>,
        now: Duration,
    ) -> Option<PreemptionSummary> {
        let priority = self.accountant.effective_priority(submitter);
        let mut candidates: Vec<(Candidate, String)> = Vec::new();
        for (index, lease) in self.leases.iter().enumerate() {
            if !lease.is_preemptible() || lease.submitter == submitter {
                continue;
            }
            if priority >= self.accountant.effective_priority(&lease.submitter) {
                continue;
            }
            let Some(machine) = machines.get(&machine_key(&lease.machine)) else {
                continue;
            };
            let outcome = is_match(&job.record, &machine.record);
            if !outcome.accepted {
                continue;
            }
            if !preemption_allowed(&machine.record, &job.record, self.config.preemption_policy()) {
                debug!(machine = %machine.name, job = %job.id, "preemption not allowed");
                continue;
            }
            let weight = self
                .accountant
                .match_for(&lease.machine)
                .map_or(1.0, |m| m.weight);
            candidates.push((
                Candidate {
                    index,
                    machine: (*machine).clone(),
                    job_rank: outcome.job_rank,
                    machine_rank: outcome.machine_rank,
                    cost: lease.held_for(now).as_secs_f64() * weight,
                },
                lease.id.clone(),
            ));
        }
        candidates.sort_by(|a, b| compare_candidates(&a.0, &b.0));
        let (best, lease_id) = candidates.into_iter().next()?;

        let grace = self.config.preemption_grace();
        if let Err(e) = self.leases.revoke(&lease_id, grace, now) {
            warn!(lease = %lease_id, error = %e, "preemption failed, lease kept");
            return None;
        }
        let victim = self.leases.get(&lease_id)?;
        info!(
            machine = %best.machine.name,
            victim = %victim.submitter,
            preemptor = submitter,
            job = %job.id,
            "machine preempted"
        );
        Some(PreemptionSummary {
            machine: best.machine.name.clone(),
            lease: lease_id.clone(),
            victim: victim.submitter.clone(),
            victim_job: victim.job.clone(),
            preemptor: submitter.to_string(),
            job: job.id.clone(),
            grace_secs: grace.as_secs(),
        })
    }

    /// Stop charging for machines that no lease holds, such as matches
    /// restored from a store after a restart or leases that just ended.
    fn drop_unleased_matches(&mut self) {
        let stale: Vec<String> = self
            .accountant
            .matches()
            .filter(|m| !self.leases.is_claimed(&m.machine))
            .map(|m| m.machine.clone())
            .collect();
        let now = self.clock.epoch_secs();
        for machine in stale {
            self.accountant.remove_match(&machine, now);
        }
    }

    fn load_machines(&self) -> NegotiationResult<Vec<MachineAd>> {
        let records = self.source.machines()?;
        let mut seen = HashSet::new();
        let mut machines = Vec::with_capacity(records.len());
        for record in records {
            match MachineAd::from_record(record) {
                Some(m) if seen.insert(machine_key(&m.name)) => machines.push(m),
                Some(m) => warn!(machine = %m.name, "duplicate machine advertisement ignored"),
                None => warn!("machine record without a Name ignored"),
            }
        }
        Ok(machines)
    }

    /// Submitter names, applying any factor or ceiling they advertise.
    fn load_submitters(&mut self) -> NegotiationResult<Vec<String>> {
        let mut names = Vec::new();
        for record in self.source.submitters()? {
            let Some(name) = record.lookup_string("Name") else {
                warn!("submitter record without a Name ignored");
                continue;
            };
            if let Some(factor) = record.lookup_real("PriorityFactor").filter(|f| *f > 0.0) {
                self.accountant.set_priority_factor(&name, factor);
            }
            if let Some(ceiling) = record.lookup_integer("Ceiling") {
                self.accountant
                    .set_ceiling(&name, u32::try_from(ceiling).ok());
            }
            names.push(name);
        }
        Ok(names)
    }

    fn finish_cycle(&mut self, report: &CycleReport) {
        if let Some(store) = &self.store {
            if let Err(e) = self.accountant.save(store) {
                error!(error = %e, "failed to persist accounting state");
            }
        }
        info!(
            cycle = report.cycle,
            matches = report.matches.len(),
            preemptions = report.preemptions.len(),
            unmatched = report.unmatched_jobs,
            "negotiation cycle finished"
        );
    }
}
