//! orch-state: embedded state store for the credential broker.
//!
//! Backed by [redb](https://docs.rs/redb), holds the resource mapping table
//! and the checkout ledger.
//!
//! # Architecture
//!
//! Domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Ledger rows use the composite key `{mapping_id}:{concrete_name}` so all
//! leases of one mapping can be found with a prefix scan.
//!
//! redb admits a single write transaction at a time. Every ledger mutation
//! reads and writes inside one write transaction, which makes a claim a
//! conditional insert rather than a check followed by an insert.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::{ClaimOutcome, ReleaseOutcome, StateStore};
