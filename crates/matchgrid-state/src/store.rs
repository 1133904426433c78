//! StateStore — redb-backed persistence for accounting state.
//!
//! Provides typed operations over submitter priorities, charged matches
//! and the last-update timestamp. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SUBMITTERS).map_err(map_err!(Table))?;
        txn.open_table(MATCHES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn delete(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Submitters ─────────────────────────────────────────────────

    /// Insert or update a submitter's priority record.
    pub fn put_submitter(&self, p: &SubmitterPriority) -> StateResult<()> {
        self.put(SUBMITTERS, p.table_key(), p)?;
        debug!(submitter = %p.submitter, priority = p.priority, "submitter stored");
        Ok(())
    }

    pub fn get_submitter(&self, submitter: &str) -> StateResult<Option<SubmitterPriority>> {
        self.get(SUBMITTERS, submitter)
    }

    /// List all submitters, ordered by name.
    pub fn list_submitters(&self) -> StateResult<Vec<SubmitterPriority>> {
        self.list(SUBMITTERS)
    }

    /// Delete a submitter. Returns true if it existed.
    pub fn delete_submitter(&self, submitter: &str) -> StateResult<bool> {
        self.delete(SUBMITTERS, submitter)
    }

    // ── Matches ────────────────────────────────────────────────────

    pub fn put_match(&self, m: &MatchRecord) -> StateResult<()> {
        self.put(MATCHES, m.table_key(), m)
    }

    pub fn get_match(&self, machine: &str) -> StateResult<Option<MatchRecord>> {
        self.get(MATCHES, machine)
    }

    pub fn list_matches(&self) -> StateResult<Vec<MatchRecord>> {
        self.list(MATCHES)
    }

    pub fn delete_match(&self, machine: &str) -> StateResult<bool> {
        self.delete(MATCHES, machine)
    }

    // ── Meta ───────────────────────────────────────────────────────

    pub fn last_update(&self) -> StateResult<Option<u64>> {
        self.get(META, LAST_UPDATE_KEY)
    }

    pub fn set_last_update(&self, at: u64) -> StateResult<()> {
        self.put(META, LAST_UPDATE_KEY, &at)
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Load everything the accountant persists.
    pub fn load_snapshot(&self) -> StateResult<AccountingSnapshot> {
        Ok(AccountingSnapshot {
            submitters: self.list_submitters()?,
            matches: self.list_matches()?,
            last_update: self.last_update()?,
        })
    }

    /// Replace the stored accounting state in one write transaction.
    pub fn save_snapshot(&self, snapshot: &AccountingSnapshot) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.delete_table(SUBMITTERS).map_err(map_err!(Table))?;
        txn.delete_table(MATCHES).map_err(map_err!(Table))?;
        {
            let mut table = txn.open_table(SUBMITTERS).map_err(map_err!(Table))?;
            for p in &snapshot.submitters {
                let value = serde_json::to_vec(p).map_err(map_err!(Serialize))?;
                table
                    .insert(p.table_key(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        {
            let mut table = txn.open_table(MATCHES).map_err(map_err!(Table))?;
            for m in &snapshot.matches {
                let value = serde_json::to_vec(m).map_err(map_err!(Serialize))?;
                table
                    .insert(m.table_key(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        if let Some(at) = snapshot.last_update {
            let mut table = txn.open_table(META).map_err(map_err!(Table))?;
            let value = serde_json::to_vec(&at).map_err(map_err!(Serialize))?;
            table
                .insert(LAST_UPDATE_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            submitters = snapshot.submitters.len(),
            matches = snapshot.matches.len(),
            "accounting snapshot saved"
        );
        Ok(())
    }
}
