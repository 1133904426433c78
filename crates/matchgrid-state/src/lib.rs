//! matchgrid-state — embedded persistence for accounting state.
//!
//! Backed by [redb](https://docs.rs/redb). Holds what must survive a
//! negotiator restart: per-submitter usage and priority, the matches that
//! are currently being charged, and the time of the last priority update.
//!
//! # Architecture
//!
//! Domain types are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by submitter name or machine name. A full accounting snapshot is
//! written in a single write transaction so a crash never leaves usage and
//! match tables out of step.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
