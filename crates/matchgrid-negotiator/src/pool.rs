//! The available-machine pool for one cycle.
//!
//! Built from the advertised machines minus those already under lease.
//! Sessions read a snapshot without holding the lock, evaluate matches,
//! and only then take the lock to claim a single entry.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use matchgrid_classad::Record;

use crate::lease::machine_key;

/// A machine record together with its name.
#[derive(Debug, Clone)]
pub struct MachineAd {
    pub name: String,
    pub record: Arc<Record>,
}

impl MachineAd {
    pub fn new(name: impl Into<String>, record: Record) -> Self {
        Self {
            name: name.into(),
            record: Arc::new(record),
        }
    }

    /// Wrap a record, naming it by its `Name` attribute.
    pub fn from_record(record: Record) -> Option<Self> {
        let name = record.lookup_string("Name")?;
        Some(Self::new(name, record))
    }
}

/// Machines open for matching this cycle, in advertisement order.
#[derive(Debug, Default)]
pub struct MachinePool {
    machines: Vec<MachineAd>,
    claimed: Mutex<HashSet<usize>>,
}

impl MachinePool {
    /// Build a pool. Later duplicates of a machine name are dropped.
    pub fn new(machines: impl IntoIterator<Item = MachineAd>) -> Self {
        let mut seen = HashSet::new();
        let machines = machines
            .into_iter()
            .filter(|m| {
                let fresh = seen.insert(machine_key(&m.name));
                if !fresh {
                    warn!(machine = %m.name, "duplicate machine advertisement ignored");
                }
                fresh
            })
            .collect();
        Self {
            machines,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MachineAd> {
        self.machines.get(index)
    }

    pub fn available_count(&self) -> usize {
        self.machines.len() - self.claimed.lock().len()
    }

    /// Unclaimed machines with their pool index, in pool order.
    pub fn snapshot_available(&self) -> Vec<(usize, MachineAd)> {
        let claimed = self.claimed.lock().clone();
        self.machines
            .iter()
            .enumerate()
            .filter(|(i, _)| !claimed.contains(i))
            .map(|(i, m)| (i, m.clone()))
            .collect()
    }

    /// Claim a machine if nobody else has. Returns whether this call won.
    pub fn try_claim(&self, index: usize) -> bool {
        index < self.machines.len() && self.claimed.lock().insert(index)
    }

    pub fn release(&self, index: usize) {
        self.claimed.lock().remove(&index);
    }

    pub fn is_claimed(&self, index: usize) -> bool {
        self.claimed.lock().contains(&index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(name: &str) -> MachineAd {
        MachineAd::from_record(Record::new().with("Name", &format!("\"{name}\"")).unwrap()).unwrap()
    }

    #[test]
    fn claims_are_exclusive() {
        let pool = MachinePool::new([machine("a"), machine("b")]);
        assert!(pool.try_claim(0));
        assert!(!pool.try_claim(0));
        assert!(!pool.try_claim(7));
        assert_eq!(pool.available_count(), 1);
        let names: Vec<String> = pool.snapshot_available().into_iter().map(|(_, m)| m.name).collect();
        assert_eq!(names, vec!["b"]);
        pool.release(0);
        assert!(!pool.is_claimed(0));
        assert_eq!(pool.available_count(), 2);
    }

    #[test]
    fn duplicates_keep_the_first() {
        let pool = MachinePool::new([machine("a"), machine("A"), machine("b")]);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(1).unwrap().name, "b");
    }

    #[test]
    fn records_without_a_name_are_not_machines() {
        assert!(MachineAd::from_record(Record::new()).is_none());
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let pool = Arc::new(MachinePool::new([machine("only")]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || pool.try_claim(0))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
