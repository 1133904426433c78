//! File-backed record source and submitter queue.
//!
//! ```text
//! <ads>/machines.ads          one long-form record per machine
//! <ads>/submitters.ads        one record per submitter (Name = "...")
//! <ads>/jobs/<submitter>.ads  that submitter's jobs, in queue order
//! ```
//!
//! Records are separated by blank lines. A record that fails to parse is
//! logged and left out; the rest of the file still loads. Files are
//! re-read every cycle, so edits show up on the next pass.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use parking_lot::Mutex;
use tracing::{debug, warn};

use matchgrid_classad::Record;
use matchgrid_negotiator::{
    JobAd, LeaseEnd, LeaseTerms, MachineAd, NegotiationError, NegotiationResult, RecordSource,
    SubmitterQueue,
};

pub const MACHINES_FILE: &str = "machines.ads";
pub const SUBMITTERS_FILE: &str = "submitters.ads";
pub const JOBS_DIR: &str = "jobs";

// ── Parsing ────────────────────────────────────────────────────────

/// Split long-form text into records, skipping any that fail to parse.
pub fn parse_ads(text: &str, origin: &str) -> Vec<Record> {
    let mut records = Vec::new();
    let mut block = String::new();
    let mut first_line = 1;
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            flush_block(&mut block, first_line, origin, &mut records);
            first_line = lineno + 2;
            continue;
        }
        block.push_str(line);
        block.push('\n');
    }
    flush_block(&mut block, first_line, origin, &mut records);
    records
}

fn flush_block(block: &mut String, first_line: usize, origin: &str, out: &mut Vec<Record>) {
    if block.is_empty() {
        return;
    }
    match Record::parse_long(block) {
        Ok(record) if record.is_empty() => {}
        Ok(record) => out.push(record),
        Err(e) => warn!(file = %origin, line = first_line, error = %e, "skipping unparsable record"),
    }
    block.clear();
}

/// Read every record in a file. A missing file holds no records.
pub fn read_ads(path: &Path) -> io::Result<Vec<Record>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(parse_ads(&text, &path.display().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(file = %path.display(), "no ads file");
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

/// Read a single record, in either bracketed or long form.
pub fn read_ad(path: &Path) -> anyhow::Result<Record> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let record = if text.trim_start().starts_with('[') {
        Record::parse(&text)
    } else {
        Record::parse_long(&text)
    };
    record.with_context(|| format!("failed to parse {}", path.display()))
}

fn source_error(path: &Path, e: io::Error) -> NegotiationError {
    NegotiationError::Source(format!("{}: {e}", path.display()))
}

// ── Record source ──────────────────────────────────────────────────

/// Machines and submitters from the ads directory.
#[derive(Debug, Clone)]
pub struct FileSource {
    dir: PathBuf,
}

impl FileSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn load(&self, file: &str) -> NegotiationResult<Vec<Record>> {
        let path = self.dir.join(file);
        read_ads(&path).map_err(|e| source_error(&path, e))
    }
}

impl RecordSource for FileSource {
    fn machines(&self) -> NegotiationResult<Vec<Record>> {
        self.load(MACHINES_FILE)
    }

    fn submitters(&self) -> NegotiationResult<Vec<Record>> {
        self.load(SUBMITTERS_FILE)
    }
}

// ── Submitter queue ────────────────────────────────────────────────

#[derive(Debug, Default)]
struct QueueState {
    /// `None` until first asked for this cycle.
    jobs: Option<Vec<JobAd>>,
    cursor: usize,
    /// Jobs holding a lease; not offered again until it ends.
    running: HashSet<String>,
}

/// Jobs from `jobs/<submitter>.ads`, handed out in file order.
///
/// Every offer is taken unless the job's `AcceptOffers` evaluates to
/// `false` against the offered machine.
#[derive(Debug)]
pub struct FileQueue {
    dir: PathBuf,
    state: Mutex<HashMap<String, QueueState>>,
}

impl FileQueue {
    pub fn new(ads_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: ads_dir.as_ref().join(JOBS_DIR),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Jobs currently holding a lease for `submitter`.
    pub fn running(&self, submitter: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .get(submitter)
            .map(|q| q.running.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn load_jobs(&self, submitter: &str) -> NegotiationResult<Vec<JobAd>> {
        if submitter.is_empty()
            || submitter.contains(['/', '\\'])
            || submitter.starts_with('.')
        {
            return Err(NegotiationError::protocol(
                submitter,
                "submitter name is not usable as a file name",
            ));
        }
        let path = self.dir.join(format!("{submitter}.ads"));
        let records = read_ads(&path).map_err(|e| source_error(&path, e))?;
        Ok(records
            .into_iter()
            .enumerate()
            .map(|(i, record)| match JobAd::from_record(record.clone()) {
                Some(job) => job,
                None => JobAd::new(format!("{submitter}#{}", i + 1), record),
            })
            .collect())
    }
}

impl SubmitterQueue for FileQueue {
    fn begin_cycle(&self) {
        for queue in self.state.lock().values_mut() {
            queue.jobs = None;
            queue.cursor = 0;
        }
    }

    fn next_job(&self, submitter: &str) -> NegotiationResult<Option<JobAd>> {
        let loaded = {
            let state = self.state.lock();
            state.get(submitter).is_some_and(|q| q.jobs.is_some())
        };
        // Read outside the lock; sessions for other submitters keep going.
        let fresh = if loaded {
            None
        } else {
            Some(self.load_jobs(submitter)?)
        };

        let mut state = self.state.lock();
        let queue = state.entry(submitter.to_string()).or_default();
        if let Some(jobs) = fresh {
            debug!(submitter = %submitter, jobs = jobs.len(), "loaded job queue");
            queue.jobs = Some(jobs);
        }
        let Some(jobs) = queue.jobs.as_ref() else {
            return Ok(None);
        };
        while let Some(job) = jobs.get(queue.cursor) {
            queue.cursor += 1;
            if !queue.running.contains(&job.id) {
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }

    fn offer(
        &self,
        submitter: &str,
        job: &JobAd,
        machine: &MachineAd,
        terms: &LeaseTerms,
    ) -> NegotiationResult<bool> {
        let accept = job
            .record
            .evaluate_attr("AcceptOffers", Some(&machine.record))
            .as_bool()
            != Some(false);
        if accept {
            self.state
                .lock()
                .entry(submitter.to_string())
                .or_default()
                .running
                .insert(job.id.clone());
        }
        debug!(
            submitter = %submitter,
            job = %job.id,
            machine = %machine.name,
            lease_secs = terms.duration_secs,
            accept,
            "offer answered"
        );
        Ok(accept)
    }

    fn lease_ended(&self, submitter: &str, job: &str, reason: LeaseEnd) {
        if let Some(queue) = self.state.lock().get_mut(submitter) {
            if queue.running.remove(job) {
                debug!(submitter = %submitter, job = %job, ?reason, "job idle again");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, text: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, text).unwrap();
    }

    fn machine(name: &str) -> MachineAd {
        MachineAd::new(name, Record::new())
    }

    fn terms() -> LeaseTerms {
        LeaseTerms {
            duration_secs: 60,
            release_when_done: true,
        }
    }

    #[test]
    fn bad_record_is_skipped_not_fatal() {
        let text = "\
# pool
Name = \"a\"
Memory = 1024

Name = \"b\"
Memory = = 2

Name = \"c\"
";
        let records = parse_ads(text, "machines.ads");
        let names: Vec<String> = records
            .iter()
            .filter_map(|r| r.lookup_string("Name"))
            .collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn runaway_expression_only_loses_its_record() {
        let text = format!(
            "Name = \"a\"\n\nName = \"b\"\nStart = {}1\n\nName = \"c\"\nRank = {}1\n\nName = \"d\"\n",
            "x ? 1 : ".repeat(50_000),
            "1 + ".repeat(50_000),
        );
        let names: Vec<String> = parse_ads(&text, "machines.ads")
            .iter()
            .filter_map(|r| r.lookup_string("Name"))
            .collect();
        assert_eq!(names, vec!["a", "d"]);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSource::new(dir.path());
        assert!(source.machines().unwrap().is_empty());
        assert!(source.submitters().unwrap().is_empty());
    }

    #[test]
    fn single_ad_in_either_form() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "wire.ad", "[ A = 1; B = A + 1 ]");
        write(dir.path(), "long.ad", "A = 1\nB = A + 1\n");
        for file in ["wire.ad", "long.ad"] {
            let ad = read_ad(&dir.path().join(file)).unwrap();
            assert_eq!(ad.lookup_integer("B"), Some(2));
        }
        assert!(read_ad(&dir.path().join("absent.ad")).is_err());
    }

    #[test]
    fn queue_hands_out_jobs_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "jobs/alice.ads",
            "JobId = \"j1\"\n\nClusterId = 7\nProcId = 2\n\nCmd = \"noid\"\n",
        );
        let queue = FileQueue::new(dir.path());
        queue.begin_cycle();
        let mut ids = Vec::new();
        while let Some(job) = queue.next_job("alice").unwrap() {
            ids.push(job.id);
        }
        assert_eq!(ids, vec!["j1", "7.2", "alice#3"]);
        assert!(queue.next_job("nobody").unwrap().is_none());
    }

    #[test]
    fn accepted_jobs_wait_for_their_lease_to_end() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "jobs/alice.ads",
            "JobId = \"j1\"\n\nJobId = \"j2\"\nAcceptOffers = false\n",
        );
        let queue = FileQueue::new(dir.path());
        queue.begin_cycle();

        let j1 = queue.next_job("alice").unwrap().unwrap();
        assert!(queue.offer("alice", &j1, &machine("m1"), &terms()).unwrap());
        let j2 = queue.next_job("alice").unwrap().unwrap();
        assert!(!queue.offer("alice", &j2, &machine("m2"), &terms()).unwrap());
        assert_eq!(queue.running("alice"), vec!["j1"]);

        // Next cycle: j1 is running, only j2 comes back.
        queue.begin_cycle();
        assert_eq!(queue.next_job("alice").unwrap().unwrap().id, "j2");
        assert!(queue.next_job("alice").unwrap().is_none());

        queue.lease_ended("alice", "j1", LeaseEnd::Expired);
        queue.begin_cycle();
        assert_eq!(queue.next_job("alice").unwrap().unwrap().id, "j1");
    }

    #[test]
    fn accept_offers_sees_the_machine() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "jobs/bob.ads",
            "JobId = \"j\"\nAcceptOffers = TARGET.Name != \"slow\"\n",
        );
        let queue = FileQueue::new(dir.path());
        queue.begin_cycle();
        let job = queue.next_job("bob").unwrap().unwrap();
        let slow = MachineAd::from_record(Record::parse("[ Name = \"slow\" ]").unwrap()).unwrap();
        let fast = MachineAd::from_record(Record::parse("[ Name = \"fast\" ]").unwrap()).unwrap();
        assert!(!queue.offer("bob", &job, &slow, &terms()).unwrap());
        assert!(queue.offer("bob", &job, &fast, &terms()).unwrap());
    }

    #[tokio::test]
    async fn cycle_over_an_ads_directory() {
        use std::sync::Arc;

        use matchgrid_negotiator::{ManualClock, Matchmaker, NegotiatorConfig};
        use tokio::sync::watch;

        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            MACHINES_FILE,
            "Name = \"m1\"\nMemory = 4096\nRequirements = true\n\n\
             Name = \"m2\"\nMemory = 512\nRequirements = true\n",
        );
        write(dir.path(), SUBMITTERS_FILE, "Name = \"alice\"\n");
        write(
            dir.path(),
            "jobs/alice.ads",
            "JobId = \"big\"\nRequirements = TARGET.Memory >= 1024\n\n\
             JobId = \"small\"\nRequirements = true\n",
        );

        let queue = Arc::new(FileQueue::new(dir.path()));
        let mut matchmaker = Matchmaker::new(
            NegotiatorConfig::default().validated().unwrap(),
            Arc::new(FileSource::new(dir.path())),
            queue.clone(),
            Arc::new(ManualClock::new(1_700_000_000)),
        );
        let (_tx, rx) = watch::channel(false);
        let report = matchmaker.run_cycle(&rx).await.unwrap();
        let pairs: Vec<(String, String)> = report
            .matches
            .iter()
            .map(|m| (m.job.clone(), m.machine.clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("big".to_string(), "m1".to_string()),
                ("small".to_string(), "m2".to_string()),
            ]
        );
        assert_eq!(queue.running("alice"), vec!["big", "small"]);

        // Nothing left to place on the next pass.
        let report = matchmaker.run_cycle(&rx).await.unwrap();
        assert!(report.matches.is_empty());
    }

    #[test]
    fn path_like_submitter_names_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::new(dir.path());
        assert!(matches!(
            queue.next_job("../etc"),
            Err(NegotiationError::Protocol { .. })
        ));
    }
}
