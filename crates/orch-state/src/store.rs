//! StateStore: redb-backed persistence for mappings and the checkout ledger.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use orch_core::{CheckoutRecord, ResourceMapping, ledger_key};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Result of an atomic claim on a ledger key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The key was free and now holds the new record.
    Claimed,
    /// The key was already held; the existing record is returned untouched.
    AlreadyHeld(CheckoutRecord),
}

/// Result of a holder-conditional delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released(CheckoutRecord),
    /// No lease exists for the key.
    NotHeld,
    /// A lease exists but belongs to another container.
    HeldByOther(CheckoutRecord),
}

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
        txn.open_table(MAPPINGS).map_err(map_err!(Table))?;
        txn.open_table(CHECKOUTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Mappings ───────────────────────────────────────────────────

    /// Insert or replace every mapping of a feed in one transaction.
    ///
    /// Returns the number of mappings written.
    pub fn load_mappings(&self, mappings: &[ResourceMapping]) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MAPPINGS).map_err(map_err!(Table))?;
            for mapping in mappings {
                let value = serde_json::to_vec(mapping).map_err(map_err!(Serialize))?;
                table
                    .insert(mapping.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(count = mappings.len(), "resource mappings loaded");
        Ok(mappings.len())
    }

    /// Get a mapping by identifier.
    pub fn get_mapping(&self, id: &str) -> StateResult<Option<ResourceMapping>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MAPPINGS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all mappings, ordered by identifier.
    pub fn list_mappings(&self) -> StateResult<Vec<ResourceMapping>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MAPPINGS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Number of stored mappings. Doubles as the store connectivity check.
    pub fn count_mappings(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MAPPINGS).map_err(map_err!(Table))?;
        let mut count = 0;
        for entry in table.iter().map_err(map_err!(Read))? {
            entry.map_err(map_err!(Read))?;
            count += 1;
        }
        Ok(count)
    }

    // ── Checkout ledger ────────────────────────────────────────────

    /// Claim `record`'s key if, and only if, nobody holds it.
    pub fn try_claim(&self, record: &CheckoutRecord) -> StateResult<ClaimOutcome> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut table = txn.open_table(CHECKOUTS).map_err(map_err!(Table))?;
            let existing: Option<CheckoutRecord> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            outcome = match existing {
                Some(held) => ClaimOutcome::AlreadyHeld(held),
                None => {
                    table
                        .insert(key.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    ClaimOutcome::Claimed
                }
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, claimed = outcome == ClaimOutcome::Claimed, "ledger claim");
        Ok(outcome)
    }

    /// Delete the lease on a key only if `holder_container_id` holds it.
    pub fn release_if_held_by(
        &self,
        mapping_id: &str,
        concrete_name: &str,
        holder_container_id: &str,
    ) -> StateResult<ReleaseOutcome> {
        let key = ledger_key(mapping_id, concrete_name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut table = txn.open_table(CHECKOUTS).map_err(map_err!(Table))?;
            let existing: Option<CheckoutRecord> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            outcome = match existing {
                None => ReleaseOutcome::NotHeld,
                Some(held) if held.holder_container_id != holder_container_id => {
                    ReleaseOutcome::HeldByOther(held)
                }
                Some(held) => {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                    ReleaseOutcome::Released(held)
                }
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, holder = %holder_container_id, ?outcome, "ledger release");
        Ok(outcome)
    }

    /// Get the lease on a key, if any.
    pub fn get_checkout(
        &self,
        mapping_id: &str,
        concrete_name: &str,
    ) -> StateResult<Option<CheckoutRecord>> {
        let key = ledger_key(mapping_id, concrete_name);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKOUTS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List every lease under one mapping (one per concrete name).
    pub fn list_checkouts_for_mapping(&self, mapping_id: &str) -> StateResult<Vec<CheckoutRecord>> {
        let prefix = format!("{mapping_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// List every lease in the ledger.
    pub fn list_checkouts(&self) -> StateResult<Vec<CheckoutRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// List the leases whose holder is not in `live_ids`.
    ///
    /// The result is only a candidate set: a holder may have started after
    /// `live_ids` was taken, so callers confirm each one before removing it
    /// with [`StateStore::release_if_held_by`].
    pub fn list_checkouts_outside(
        &self,
        live_ids: &HashSet<String>,
    ) -> StateResult<Vec<CheckoutRecord>> {
        Ok(self
            .list_checkouts()?
            .into_iter()
            .filter(|record| !live_ids.contains(&record.holder_container_id))
            .collect())
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}
