//! redb table definitions for the orch state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Resource mappings keyed by `{mapping_id}`.
pub const MAPPINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("resource_mappings");

/// Active leases keyed by `{mapping_id}:{concrete_name}`.
pub const CHECKOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("resource_checkouts");
