//! Negotiation cycle integration tests.
//!
//! Drives full matchmaker cycles against in-memory record sources and
//! submitter queues, with a manual clock for lease and grace timing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use matchgrid_classad::Record;
use matchgrid_negotiator::*;
use matchgrid_state::StateStore;
use parking_lot::Mutex;
use tokio::sync::watch;

// ── Collaborators ──────────────────────────────────────────────────

#[derive(Default)]
struct TestSource {
    machines: Mutex<Vec<Record>>,
    submitters: Mutex<Vec<Record>>,
}

impl RecordSource for TestSource {
    fn machines(&self) -> NegotiationResult<Vec<Record>> {
        Ok(self.machines.lock().clone())
    }

    fn submitters(&self) -> NegotiationResult<Vec<Record>> {
        Ok(self.submitters.lock().clone())
    }
}

struct QueuedJob {
    job: JobAd,
    running: bool,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Vec<QueuedJob>>,
    cursor: HashMap<String, usize>,
    /// Submitters that keep handing out their first job.
    stuck: HashSet<String>,
    offers: Vec<(String, String)>,
}

#[derive(Default)]
struct TestQueue {
    state: Mutex<QueueState>,
}

impl TestQueue {
    fn add(&self, submitter: &str, job: JobAd) {
        self.state
            .lock()
            .jobs
            .entry(submitter.to_string())
            .or_default()
            .push(QueuedJob { job, running: false });
    }

    fn offers(&self) -> Vec<(String, String)> {
        self.state.lock().offers.clone()
    }
}

impl SubmitterQueue for TestQueue {
    fn begin_cycle(&self) {
        self.state.lock().cursor.clear();
    }

    fn next_job(&self, submitter: &str) -> NegotiationResult<Option<JobAd>> {
        let mut state = self.state.lock();
        let stuck = state.stuck.contains(submitter);
        let start = state.cursor.get(submitter).copied().unwrap_or(0);
        let Some(jobs) = state.jobs.get(submitter) else {
            return Ok(None);
        };
        if stuck {
            return Ok(jobs.first().map(|q| q.job.clone()));
        }
        let next = (start..jobs.len()).find(|&i| !jobs[i].running);
        let job = next.map(|i| jobs[i].job.clone());
        if let Some(i) = next {
            state.cursor.insert(submitter.to_string(), i + 1);
        }
        Ok(job)
    }

    fn offer(
        &self,
        submitter: &str,
        job: &JobAd,
        machine: &MachineAd,
        _terms: &LeaseTerms,
    ) -> NegotiationResult<bool> {
        let mut state = self.state.lock();
        state.offers.push((job.id.clone(), machine.name.clone()));
        let accept = job.record.lookup_bool("AcceptOffers").unwrap_or(true);
        if accept {
            if let Some(q) = state
                .jobs
                .get_mut(submitter)
                .and_then(|jobs| jobs.iter_mut().find(|q| q.job.id == job.id))
            {
                q.running = true;
            }
        }
        Ok(accept)
    }
}

// ── Harness ────────────────────────────────────────────────────────

fn machine(name: &str, extra: &str) -> Record {
    Record::parse(&format!("[ Name = \"{name}\"; Requirements = true; {extra} ]")).unwrap()
}

fn submitter(name: &str, extra: &str) -> Record {
    Record::parse(&format!("[ Name = \"{name}\"; {extra} ]")).unwrap()
}

fn job(id: &str, extra: &str) -> JobAd {
    JobAd::from_record(
        Record::parse(&format!("[ JobId = \"{id}\"; Requirements = true; {extra} ]")).unwrap(),
    )
    .unwrap()
}

struct Harness {
    matchmaker: Matchmaker,
    source: Arc<TestSource>,
    queue: Arc<TestQueue>,
    clock: Arc<ManualClock>,
    shutdown_tx: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
}

impl Harness {
    fn new(config: NegotiatorConfig, machines: Vec<Record>, submitters: Vec<Record>) -> Self {
        let source = Arc::new(TestSource::default());
        *source.machines.lock() = machines;
        *source.submitters.lock() = submitters;
        let queue = Arc::new(TestQueue::default());
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let matchmaker = Matchmaker::new(config, source.clone(), queue.clone(), clock.clone());
        let (shutdown_tx, shutdown) = watch::channel(false);
        Self {
            matchmaker,
            source,
            queue,
            clock,
            shutdown_tx,
            shutdown,
        }
    }

    async fn cycle(&mut self) -> CycleReport {
        self.matchmaker.run_cycle(&self.shutdown).await.unwrap()
    }

    fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }
}

fn matched(report: &CycleReport) -> Vec<(String, String)> {
    report
        .matches
        .iter()
        .map(|m| (m.submitter.clone(), m.machine.clone()))
        .collect()
}

// ── Fairness ───────────────────────────────────────────────────────

#[tokio::test]
async fn lower_usage_negotiates_first() {
    let mut h = Harness::new(
        NegotiatorConfig::default(),
        vec![machine("slot1", "")],
        vec![submitter("heavy@site", ""), submitter("light@site", "")],
    );
    h.matchmaker.accountant_mut().set_priority("heavy@site", 100.0);
    h.queue.add("heavy@site", job("h.1", ""));
    h.queue.add("light@site", job("l.1", ""));

    let report = h.cycle().await;
    assert_eq!(report.submitters, vec!["light@site", "heavy@site"]);
    assert_eq!(matched(&report), vec![("light@site".to_string(), "slot1".to_string())]);
    assert_eq!(h.queue.offers().len(), 1);
}

#[tokio::test]
async fn equal_priorities_order_by_name() {
    let mut h = Harness::new(
        NegotiatorConfig::default(),
        vec![machine("slot1", "")],
        vec![submitter("zed", ""), submitter("amy", "")],
    );
    h.queue.add("zed", job("z.1", ""));
    h.queue.add("amy", job("a.1", ""));
    let report = h.cycle().await;
    assert_eq!(report.submitters, vec!["amy", "zed"]);
    assert_eq!(report.matches[0].submitter, "amy");
}

#[tokio::test]
async fn slices_interleave_submitters() {
    let mut config = NegotiatorConfig::default();
    config.fair_share_slice = 1;
    let mut h = Harness::new(
        config,
        vec![machine("m1", ""), machine("m2", ""), machine("m3", "")],
        vec![submitter("a", ""), submitter("b", "")],
    );
    for i in 0..3 {
        h.queue.add("a", job(&format!("a.{i}"), ""));
        h.queue.add("b", job(&format!("b.{i}"), ""));
    }
    let report = h.cycle().await;
    let order: Vec<String> = report.matches.iter().map(|m| m.submitter.clone()).collect();
    assert_eq!(order, vec!["a", "b", "a"]);
}

// ── Matching ───────────────────────────────────────────────────────

#[tokio::test]
async fn undefined_requirements_never_match() {
    let mut h = Harness::new(
        NegotiatorConfig::default(),
        vec![machine("strict", "Requirements = TARGET.Owner == \"alice\"")],
        vec![submitter("alice", "")],
    );
    // The job has no Owner, so the machine's requirements are undefined.
    h.queue.add("alice", job("1.0", ""));
    h.queue.add("alice", job("1.1", "Requirements = TARGET.NoSuchAttr > 3"));
    let report = h.cycle().await;
    assert!(report.matches.is_empty());
    assert_eq!(report.unmatched_jobs, 2);
}

#[tokio::test]
async fn ties_follow_snapshot_order_every_run() {
    for _ in 0..5 {
        let mut h = Harness::new(
            NegotiatorConfig::default(),
            vec![
                machine("first", "Rank = 1"),
                machine("second", "Rank = 1"),
                machine("third", "Rank = 1"),
            ],
            vec![submitter("alice", "")],
        );
        h.queue.add("alice", job("1.0", "Rank = 0"));
        let report = h.cycle().await;
        assert_eq!(report.matches[0].machine, "first");
    }
}

#[tokio::test]
async fn job_rank_picks_the_preferred_machine() {
    let mut h = Harness::new(
        NegotiatorConfig::default(),
        vec![machine("small", "Memory = 1024"), machine("big", "Memory = 8192")],
        vec![submitter("alice", "")],
    );
    h.queue.add("alice", job("1.0", "Rank = TARGET.Memory"));
    let report = h.cycle().await;
    assert_eq!(report.matches[0].machine, "big");
    assert_eq!(report.matches[0].job_rank, 8192.0);
}

#[tokio::test]
async fn rejected_offer_tries_the_next_machine() {
    let mut h = Harness::new(
        NegotiatorConfig::default(),
        vec![machine("m1", ""), machine("m2", "")],
        vec![submitter("alice", "")],
    );
    h.queue.add("alice", job("1.0", "AcceptOffers = false"));
    let report = h.cycle().await;
    assert!(report.matches.is_empty());
    assert_eq!(h.queue.offers().len(), 2);
    assert!(!h.matchmaker.leases().is_claimed("m1"));
}

// ── Limits ─────────────────────────────────────────────────────────

#[tokio::test]
async fn ceiling_caps_matches() {
    let mut h = Harness::new(
        NegotiatorConfig::default(),
        vec![machine("m1", ""), machine("m2", ""), machine("m3", "")],
        vec![submitter("alice", "Ceiling = 1")],
    );
    for i in 0..3 {
        h.queue.add("alice", job(&format!("1.{i}"), ""));
    }
    let report = h.cycle().await;
    assert_eq!(report.matches.len(), 1);
    // Still capped next cycle, now by the held lease.
    h.advance(10);
    assert!(h.cycle().await.matches.is_empty());
}

#[tokio::test]
async fn concurrency_limits_span_submitters() {
    let mut config = NegotiatorConfig::default();
    config.concurrency_limits.insert("license".to_string(), 1.0);
    let mut h = Harness::new(
        config,
        vec![machine("m1", ""), machine("m2", "")],
        vec![submitter("a", ""), submitter("b", "")],
    );
    h.queue.add("a", job("a.1", "ConcurrencyLimits = \"license\""));
    h.queue.add("b", job("b.1", "ConcurrencyLimits = \"LICENSE\""));
    h.queue.add("b", job("b.2", ""));
    let report = h.cycle().await;
    let jobs: Vec<&str> = report.matches.iter().map(|m| m.job.as_str()).collect();
    assert_eq!(jobs, vec!["a.1", "b.2"]);
    assert_eq!(h.matchmaker.accountant().limits().count("license"), 1.0);
}

// ── Leases and preemption ──────────────────────────────────────────

#[tokio::test]
async fn preempted_machine_returns_after_grace() {
    let mut h = Harness::new(
        NegotiatorConfig::default(),
        vec![machine("M", "PreemptionRequirements = true")],
        vec![submitter("high", ""), submitter("low", "")],
    );
    h.matchmaker.accountant_mut().set_priority("low", 100.0);
    h.queue.add("low", job("low.1", ""));

    let first = h.cycle().await;
    assert_eq!(matched(&first), vec![("low".to_string(), "M".to_string())]);

    h.queue.add("high", job("high.1", ""));
    h.advance(10);
    let second = h.cycle().await;
    assert!(second.matches.is_empty());
    assert_eq!(second.preemptions.len(), 1);
    assert_eq!(second.preemptions[0].victim, "low");
    assert_eq!(second.preemptions[0].preemptor, "high");

    // One second short of the grace period.
    h.advance(599);
    let third = h.cycle().await;
    assert!(third.matches.is_empty());
    assert!(third.preemptions.is_empty());
    assert!(h.matchmaker.leases().is_claimed("M"));

    h.advance(1);
    let fourth = h.cycle().await;
    assert_eq!(fourth.ended_leases[0].reason, LeaseEnd::Preempted);
    assert_eq!(matched(&fourth), vec![("high".to_string(), "M".to_string())]);
}

#[tokio::test]
async fn no_policy_means_no_preemption() {
    let mut h = Harness::new(
        NegotiatorConfig::default(),
        vec![machine("M", "")],
        vec![submitter("high", ""), submitter("low", "")],
    );
    h.matchmaker.accountant_mut().set_priority("low", 100.0);
    h.queue.add("low", job("low.1", ""));
    h.cycle().await;
    h.queue.add("high", job("high.1", ""));
    h.advance(10);
    let report = h.cycle().await;
    assert!(report.preemptions.is_empty());
    assert_eq!(report.unmatched_jobs, 1);
}

#[tokio::test]
async fn configured_policy_applies_to_bare_machines() {
    let config = NegotiatorConfig::default()
        .with_preemption_requirements("TARGET.Urgent =?= true")
        .unwrap();
    let mut h = Harness::new(
        config,
        vec![machine("M", "")],
        vec![submitter("high", ""), submitter("low", "")],
    );
    h.matchmaker.accountant_mut().set_priority("low", 100.0);
    h.queue.add("low", job("low.1", ""));
    h.cycle().await;
    h.queue.add("high", job("high.1", "Urgent = true"));
    h.advance(10);
    assert_eq!(h.cycle().await.preemptions.len(), 1);
}

#[tokio::test]
async fn higher_usage_never_preempts_lower() {
    let mut h = Harness::new(
        NegotiatorConfig::default(),
        vec![machine("M", "PreemptionRequirements = true")],
        vec![submitter("high", ""), submitter("low", "")],
    );
    h.matchmaker.accountant_mut().set_priority("low", 100.0);
    h.queue.add("high", job("high.1", ""));
    h.cycle().await;
    h.queue.add("low", job("low.1", ""));
    h.advance(10);
    assert!(h.cycle().await.preemptions.is_empty());
}

#[tokio::test]
async fn expired_leases_return_machines_and_stop_charging() {
    let mut h = Harness::new(
        NegotiatorConfig::default(),
        vec![machine("M", "")],
        vec![submitter("alice", "")],
    );
    h.queue.add("alice", job("1.0", "LeaseDuration = 60"));
    let first = h.cycle().await;
    assert_eq!(first.matches[0].lease_secs, 60);
    assert!(h.matchmaker.accountant().match_for("M").is_some());

    h.advance(60);
    let second = h.cycle().await;
    assert_eq!(second.ended_leases.len(), 1);
    assert_eq!(second.ended_leases[0].reason, LeaseEnd::Expired);
    assert!(h.matchmaker.accountant().match_for("M").is_none());
    assert!(h.matchmaker.accountant().submitter("alice").unwrap().accumulated_usage > 0.0);
}

#[tokio::test]
async fn released_lease_frees_machine() {
    let mut h = Harness::new(
        NegotiatorConfig::default(),
        vec![machine("M", "")],
        vec![submitter("alice", "")],
    );
    h.queue.add("alice", job("1.0", ""));
    let report = h.cycle().await;
    let lease = report.matches[0].lease.clone();
    h.matchmaker.release_lease(&lease).unwrap();
    assert!(!h.matchmaker.leases().is_claimed("M"));
    assert!(h.matchmaker.release_lease(&lease).is_err());
}

#[tokio::test]
async fn leased_machine_stays_claimed_under_another_spelling() {
    let mut h = Harness::new(
        NegotiatorConfig::default(),
        vec![machine("slot1@node", "")],
        vec![submitter("alice", ""), submitter("bob", "")],
    );
    h.queue.add("alice", job("a.1", ""));
    let first = h.cycle().await;
    assert_eq!(matched(&first), vec![("alice".to_string(), "slot1@node".to_string())]);

    *h.source.machines.lock() = vec![machine("Slot1@Node", "")];
    h.queue.add("bob", job("b.1", ""));
    h.advance(10);
    let second = h.cycle().await;
    assert_eq!(second.machines_available, 0);
    assert!(second.matches.is_empty());
    assert_eq!(h.matchmaker.leases().len(), 1);
    assert!(h.matchmaker.leases().is_claimed("SLOT1@NODE"));
    assert_eq!(h.matchmaker.accountant().matches().count(), 1);
    assert_eq!(h.matchmaker.accountant().resources_used("alice"), 1);
    assert_eq!(h.matchmaker.accountant().resources_used("bob"), 0);
}

// ── Robustness ─────────────────────────────────────────────────────

#[tokio::test]
async fn empty_pool_negotiates_nobody() {
    let mut h = Harness::new(NegotiatorConfig::default(), Vec::new(), vec![submitter("alice", "")]);
    h.queue.add("alice", job("1.0", ""));
    let report = h.cycle().await;
    assert!(report.submitters.is_empty());
    assert!(h.queue.offers().is_empty());
}

#[tokio::test]
async fn misbehaving_submitter_is_abandoned_alone() {
    let mut h = Harness::new(
        NegotiatorConfig::default(),
        vec![machine("m1", "")],
        vec![submitter("bad", ""), submitter("good", "")],
    );
    h.queue.add("bad", job("b.1", "Requirements = false"));
    h.queue.state.lock().stuck.insert("bad".to_string());
    h.queue.add("good", job("g.1", ""));
    let report = h.cycle().await;
    assert_eq!(report.abandoned, vec!["bad"]);
    assert_eq!(matched(&report), vec![("good".to_string(), "m1".to_string())]);
}

#[tokio::test]
async fn shutdown_aborts_before_matching() {
    let mut h = Harness::new(
        NegotiatorConfig::default(),
        vec![machine("m1", "")],
        vec![submitter("alice", "")],
    );
    h.queue.add("alice", job("1.0", ""));
    h.shutdown_tx.send(true).unwrap();
    let report = h.cycle().await;
    assert!(report.aborted);
    assert!(report.matches.is_empty());
}

#[tokio::test]
async fn concurrent_sessions_never_share_a_machine() {
    let mut config = NegotiatorConfig::default();
    config.max_concurrent_sessions = 4;
    config.fair_share_slice = 2;
    let machines = (0..8).map(|i| machine(&format!("m{i}"), "")).collect();
    let submitters = (0..4).map(|i| submitter(&format!("s{i}"), "")).collect();
    let mut h = Harness::new(config, machines, submitters);
    for s in 0..4 {
        for j in 0..3 {
            h.queue.add(&format!("s{s}"), job(&format!("{s}.{j}"), ""));
        }
    }
    let report = h.cycle().await;
    assert_eq!(report.matches.len(), 8);
    let distinct: HashSet<&str> = report.matches.iter().map(|m| m.machine.as_str()).collect();
    assert_eq!(distinct.len(), 8);
}

#[tokio::test]
async fn accounting_is_persisted_each_cycle() {
    let store = StateStore::open_in_memory().unwrap();
    let source = Arc::new(TestSource::default());
    *source.machines.lock() = vec![machine("M", "SlotWeight = 2")];
    *source.submitters.lock() = vec![submitter("alice", "")];
    let queue = Arc::new(TestQueue::default());
    queue.add("alice", job("1.0", ""));
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let mut matchmaker = Matchmaker::new(NegotiatorConfig::default(), source, queue, clock)
        .with_store(store.clone())
        .unwrap();
    let (_tx, rx) = watch::channel(false);
    matchmaker.run_cycle(&rx).await.unwrap();

    let saved = store.list_matches().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].submitter, "alice");
    assert_eq!(saved[0].weight, 2.0);
    assert_eq!(store.last_update().unwrap(), Some(1_700_000_000));
}

#[tokio::test]
async fn report_serializes_to_json() {
    let mut h = Harness::new(
        NegotiatorConfig::default(),
        vec![machine("m1", "")],
        vec![submitter("alice", "")],
    );
    h.queue.add("alice", job("1.0", ""));
    let report = h.cycle().await;
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["matches"][0]["machine"], "m1");
    assert_eq!(json["cycle"], 1);
}
