//! redb table definitions for the MatchGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Submitter usage and priority keyed by `{submitter}`.
pub const SUBMITTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("submitters");

/// Charged matches keyed by `{machine}`.
pub const MATCHES: TableDefinition<&str, &[u8]> = TableDefinition::new("matches");

/// Scalar bookkeeping (e.g. `last_update`).
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Key in [`META`] holding the time of the last priority update.
pub const LAST_UPDATE_KEY: &str = "last_update";
